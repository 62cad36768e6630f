#![forbid(unsafe_code)]

//! FrankenSundials session layer: drive the time-stepping solver engine
//! from ordinary Rust code, with closures as callbacks and errors as
//! values.
//!
//! The engine ([`fsun_engine`]) holds opaque, manually managed state and
//! calls back through plain `fn` pointers that only understand integers.
//! This crate reconciles that world with the host's: sessions own the
//! engine handle and a callback table, trampolines marshal buffers into
//! scope-bounded views, and the status bridge turns host failures into the
//! three-valued `{0, 1, -1}` protocol and replays captured errors once the
//! engine returns.
//!
//! ## Module layout
//!
//! | Module      | Contents                                               |
//! |-------------|--------------------------------------------------------|
//! | `session`   | [`Session`]: creation, advance, reinit, options, stats |
//! | `adjoint`   | [`BackwardSession`], checkpointed forward integration  |
//! | `linsolv`   | Linear-solver / preconditioner attachment              |
//! | `callbacks` | Argument records and dispatch trampolines              |
//! | `status`    | Exception/status bridge                                |
//! | `registry`  | Token arena backing the weak self-references           |
//! | `error`     | [`SolverError`], [`CallbackFailure`]                   |
//!
//! ## Calling convention
//!
//! `advance` blocks until the engine returns, during which the engine
//! invokes registered closures any number of times. Closures receive views
//! that die with the invocation and must not re-enter engine-driving
//! operations on the same session graph; the runtime rejects re-entry.

pub mod adjoint;
pub mod callbacks;
pub mod error;
pub mod linsolv;
mod registry;
pub mod session;
mod status;

pub use adjoint::BackwardSession;
pub use callbacks::{
    BackwardJacobianArg, ErrorDetails, JacobianArg, SpilsSolveArg, Workspace,
};
pub use error::{BoxedError, CallbackFailure, CbResult, RecoverableSignal, SolverError};
pub use session::{
    DEFAULT_TOLERANCES, Iter, LinearSolverSpec, Session, SessionConfig, SolverOutcome,
};

// The engine contract types a caller needs to configure a session.
pub use fsun_engine::{
    BandBlockBandwidths, BandMatrixView, Bandwidths, DenseMatrixView, IntegratorStats, Lmm,
    PrecType,
};
pub use fsun_nvec::{ScopedView, ScopedViewMut};

#[cfg(test)]
mod tests {
    use fsun_engine::{CALLBACK_DISPATCH_ORDER, CallbackKind};

    // The registration-table order is a contract with the engine; if this
    // enumeration drifts, callbacks would be misrouted silently. Assert it.
    #[test]
    fn test_lib_callback_dispatch_order_matches_engine_contract() {
        let expected = [
            CallbackKind::Rhs,
            CallbackKind::Roots,
            CallbackKind::ErrHandler,
            CallbackKind::ErrWeight,
            CallbackKind::DenseJac,
            CallbackKind::BandJac,
            CallbackKind::PrecSetup,
            CallbackKind::PrecSolve,
            CallbackKind::JacTimes,
            CallbackKind::BbdLocal,
            CallbackKind::BbdComm,
            CallbackKind::RhsB,
            CallbackKind::QuadRhsB,
            CallbackKind::DenseJacB,
            CallbackKind::BandJacB,
            CallbackKind::PrecSetupB,
            CallbackKind::PrecSolveB,
            CallbackKind::JacTimesB,
            CallbackKind::BbdLocalB,
            CallbackKind::BbdCommB,
        ];
        assert_eq!(CALLBACK_DISPATCH_ORDER.len(), expected.len());
        for (got, want) in CALLBACK_DISPATCH_ORDER.iter().zip(expected.iter()) {
            assert_eq!(got, want, "callback dispatch order drifted");
        }
    }
}
