#![forbid(unsafe_code)]

//! The time-stepping solver engine.
//!
//! This crate is the "native side" of the workspace: an opaque, manually
//! managed [`EngineMem`] per integration problem, a flat integer status
//! protocol, and callbacks registered as plain `fn` pointers that receive an
//! opaque [`UserToken`] instead of a closure environment. Everything a host
//! binding needs is reachable through `EngineMem`; nothing in here knows
//! about sessions, closures, or host error values.
//!
//! ## Module layout
//!
//! | Module     | Contents                                                  |
//! |------------|-----------------------------------------------------------|
//! | `flags`    | Status codes returned by `advance` and every setter       |
//! | `types`    | Callback `fn`-pointer signatures and [`CallbackKind`]     |
//! | `matrix`   | [`DenseMatrix`], [`BandMatrix`] and their guarded views   |
//! | `mem`      | [`EngineMem`]: creation, options, statistics, adjoint API |
//! | `stepper`  | Predictor-corrector step loop, error control, weights     |
//! | `lsolve`   | Newton machinery: dense/band/diagonal/Krylov modules      |
//! | `rootfind` | Sign-change detection and bisection refinement            |
//! | `adjoint`  | Forward checkpoint history and interpolation              |
//! | `bbd`      | Band-block-diagonal preconditioner construction           |

pub mod adjoint;
pub mod bbd;
pub mod flags;
pub mod lsolve;
pub mod matrix;
pub mod mem;
pub mod rootfind;
pub mod stepper;
pub mod types;

pub use flags::*;
pub use matrix::{BandMatrix, BandMatrixView, DenseMatrix, DenseMatrixView};
pub use mem::{EngineMem, IntegratorStats, Lmm, StepMode};
pub use types::{
    BandJacFn, BandJacFnB, BbdCommFn, BbdCommFnB, BbdLocalFn, BbdLocalFnB,
    CALLBACK_DISPATCH_ORDER, CallbackKind, DenseJacFn, DenseJacFnB, ErrHandlerFn, EwtFn,
    JacTimesFn, JacTimesFnB, PrecSetupFn, PrecSetupFnB, PrecSolveFn, PrecSolveFnB, PrecType,
    QuadRhsFnB, RhsFn, RhsFnB, RootsFn, UserToken,
};

/// Per-problem bandwidth pair for the banded direct solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Bandwidths {
    pub mupper: usize,
    pub mlower: usize,
}

/// Difference-quotient and retained bandwidths for the band-block-diagonal
/// preconditioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BandBlockBandwidths {
    pub mudq: usize,
    pub mldq: usize,
    pub mukeep: usize,
    pub mlkeep: usize,
}
