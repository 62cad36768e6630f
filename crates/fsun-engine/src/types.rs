#![forbid(unsafe_code)]

//! Callback `fn`-pointer signatures and the registration-order contract.
//!
//! Every callback receives the session's opaque [`UserToken`] as its last
//! argument and reports through the three-valued integer protocol (except
//! the error handler, which is informational and returns nothing). Buffer
//! arguments are engine-owned; their contents are only meaningful for the
//! duration of the call.

use fsun_nvec::RealBuffer;

use crate::matrix::{BandMatrix, DenseMatrix};

/// Opaque token the engine stores per problem ("user data") and passes back
/// to every callback. The binding layer resolves it to its own state.
pub type UserToken = u64;

/// Preconditioning side for the Krylov solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PrecType {
    None,
    Left,
    Right,
    Both,
}

pub type RhsFn = fn(t: f64, y: &RealBuffer, ydot: &RealBuffer, user: UserToken) -> i32;

pub type RootsFn = fn(t: f64, y: &RealBuffer, gout: &RealBuffer, user: UserToken) -> i32;

/// Fills `ewt` with the reciprocal error weights for `y`.
pub type EwtFn = fn(y: &RealBuffer, ewt: &RealBuffer, user: UserToken) -> i32;

/// Informational only; has no status to return.
pub type ErrHandlerFn =
    fn(code: i32, module: &'static str, function: &'static str, msg: &str, user: UserToken);

pub type DenseJacFn = fn(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jac: &DenseMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

pub type BandJacFn = fn(
    mupper: usize,
    mlower: usize,
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jac: &BandMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

pub type PrecSetupFn = fn(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jok: bool,
    jcur: &mut bool,
    gamma: f64,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

#[allow(clippy::too_many_arguments)]
pub type PrecSolveFn = fn(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    r: &RealBuffer,
    z: &RealBuffer,
    gamma: f64,
    delta: f64,
    left: bool,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32;

pub type JacTimesFn = fn(
    v: &RealBuffer,
    jv: &RealBuffer,
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32;

pub type BbdLocalFn =
    fn(nlocal: usize, t: f64, y: &RealBuffer, glocal: &RealBuffer, user: UserToken) -> i32;

pub type BbdCommFn = fn(nlocal: usize, t: f64, y: &RealBuffer, user: UserToken) -> i32;

pub type BbdLocalFnB = fn(
    nlocal: usize,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    gblocal: &RealBuffer,
    user: UserToken,
) -> i32;

pub type BbdCommFnB =
    fn(nlocal: usize, t: f64, y: &RealBuffer, yb: &RealBuffer, user: UserToken) -> i32;

// Backward-problem signatures carry the interpolated forward state `y` in
// addition to the backward state `yb`.

pub type RhsFnB =
    fn(t: f64, y: &RealBuffer, yb: &RealBuffer, ybdot: &RealBuffer, user: UserToken) -> i32;

pub type QuadRhsFnB =
    fn(t: f64, y: &RealBuffer, yb: &RealBuffer, qbdot: &RealBuffer, user: UserToken) -> i32;

pub type DenseJacFnB = fn(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jac: &DenseMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

#[allow(clippy::too_many_arguments)]
pub type BandJacFnB = fn(
    mupper: usize,
    mlower: usize,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jac: &BandMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

#[allow(clippy::too_many_arguments)]
pub type PrecSetupFnB = fn(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jok: bool,
    jcur: &mut bool,
    gamma: f64,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32;

#[allow(clippy::too_many_arguments)]
pub type PrecSolveFnB = fn(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    r: &RealBuffer,
    z: &RealBuffer,
    gamma: f64,
    delta: f64,
    left: bool,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32;

#[allow(clippy::too_many_arguments)]
pub type JacTimesFnB = fn(
    v: &RealBuffer,
    jv: &RealBuffer,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32;

/// Every callback kind the engine can dispatch to.
///
/// The discriminant order IS the registration-table order; a binding layer
/// that enumerates kinds in a different order will misroute callbacks, so
/// it must assert against [`CALLBACK_DISPATCH_ORDER`] rather than assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Rhs,
    Roots,
    ErrHandler,
    ErrWeight,
    DenseJac,
    BandJac,
    PrecSetup,
    PrecSolve,
    JacTimes,
    BbdLocal,
    BbdComm,
    RhsB,
    QuadRhsB,
    DenseJacB,
    BandJacB,
    PrecSetupB,
    PrecSolveB,
    JacTimesB,
    BbdLocalB,
    BbdCommB,
}

/// The engine's dispatch-table order, exposed so bindings can verify their
/// own enumeration agrees with it.
pub const CALLBACK_DISPATCH_ORDER: [CallbackKind; 20] = [
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_dispatch_order_is_dense_in_kind_space() {
        // Each kind appears exactly once.
        for (i, a) in CALLBACK_DISPATCH_ORDER.iter().enumerate() {
            for (j, b) in CALLBACK_DISPATCH_ORDER.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "duplicate kind in dispatch order");
                }
            }
        }
    }
}
