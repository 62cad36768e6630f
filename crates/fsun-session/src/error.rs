#![forbid(unsafe_code)]

//! Error taxonomy for the binding layer.
//!
//! Three families: engine-originated failures (one variant per engine
//! status code), host-originated callback failures (captured and replayed
//! verbatim through [`SolverError::CallbackFailed`]), and binding-layer
//! precondition violations (`SessionClosed`, `InvalidArg`). Lifetime
//! violations are not represented here at all; they panic.

use std::fmt;

use fsun_engine::flags::*;
use thiserror::Error;

/// Host error value carried through the engine's integer-only call stack.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a user callback reports back to the engine.
#[derive(Debug)]
pub enum CallbackFailure {
    /// Ask the engine to retry with adjusted internal parameters. Only
    /// honored by retry-capable callback kinds.
    Recoverable,
    /// Any other failure; captured and replayed at the `advance` boundary.
    Fatal(BoxedError),
}

impl CallbackFailure {
    pub fn fatal<E>(err: E) -> Self
    where
        E: Into<BoxedError>,
    {
        CallbackFailure::Fatal(err.into())
    }
}

/// Callback result shorthand used throughout the callback table.
pub type CbResult = Result<(), CallbackFailure>;

/// Stored in the capture slot when a callback signals `Recoverable` from a
/// kind that does not permit retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignal;

impl fmt::Display for RecoverableSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recoverable failure signaled from a callback kind that does not permit retries"
        )
    }
}

impl std::error::Error for RecoverableSignal {}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("illegal input to the solver engine")]
    IllInput,
    #[error("requested output time too close to the current time")]
    TooClose,
    #[error("maximum number of internal steps taken before reaching the output time")]
    TooMuchWork,
    #[error("requested accuracy exceeds machine precision")]
    TooMuchAccuracy,
    #[error("repeated error test failures")]
    ErrFailure,
    #[error("repeated convergence failures in the nonlinear iteration")]
    ConvergenceFailure,
    #[error("linear solver initialization failed")]
    LinearInitFailure,
    #[error("linear solver setup failed unrecoverably")]
    LinearSetupFailure,
    #[error("linear solver solve failed unrecoverably")]
    LinearSolveFailure,
    #[error("right-hand-side function failed unrecoverably")]
    RhsFuncFailure,
    #[error("right-hand-side function failed at the first call")]
    FirstRhsFuncErr,
    #[error("right-hand-side function kept failing recoverably")]
    RepeatedRhsFuncErr,
    #[error("right-hand-side function failed after a recoverable failure")]
    UnrecoverableRhsFuncErr,
    #[error("root function failed")]
    RootFuncFailure,
    #[error("illegal derivative order requested from the interpolant")]
    BadK,
    #[error("requested interpolation time outside the last step")]
    BadT,
    #[error("illegal output vector passed to the interpolant")]
    BadDky,
    #[error("quadrature right-hand-side function failed")]
    QuadRhsFuncFailure,
    #[error("engine initialization failed: {0}")]
    EngineInitFailure(&'static str),
    #[error("operation on a closed session")]
    SessionClosed,
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("callback failure")]
    CallbackFailed(#[source] BoxedError),
    #[error("could not open diagnostic file")]
    Io(#[from] std::io::Error),
    #[error("engine call {call} returned unexpected status {flag}")]
    Engine { call: &'static str, flag: i32 },
}

impl SolverError {
    /// Downcast a replayed callback error to its concrete type.
    #[must_use]
    pub fn callback_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            SolverError::CallbackFailed(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub(crate) fn from_flag(call: &'static str, flag: i32) -> SolverError {
    match flag {
        ENG_ILL_INPUT => SolverError::IllInput,
        ENG_TOO_CLOSE => SolverError::TooClose,
        ENG_TOO_MUCH_WORK => SolverError::TooMuchWork,
        ENG_TOO_MUCH_ACC => SolverError::TooMuchAccuracy,
        ENG_ERR_FAILURE => SolverError::ErrFailure,
        ENG_CONV_FAILURE => SolverError::ConvergenceFailure,
        ENG_LINIT_FAIL => SolverError::LinearInitFailure,
        ENG_LSETUP_FAIL => SolverError::LinearSetupFailure,
        ENG_LSOLVE_FAIL => SolverError::LinearSolveFailure,
        ENG_RHSFUNC_FAIL => SolverError::RhsFuncFailure,
        ENG_FIRST_RHSFUNC_ERR => SolverError::FirstRhsFuncErr,
        ENG_REPTD_RHSFUNC_ERR => SolverError::RepeatedRhsFuncErr,
        ENG_UNREC_RHSFUNC_ERR => SolverError::UnrecoverableRhsFuncErr,
        ENG_RTFUNC_FAIL => SolverError::RootFuncFailure,
        ENG_BAD_K => SolverError::BadK,
        ENG_BAD_T => SolverError::BadT,
        ENG_BAD_DKY => SolverError::BadDky,
        ENG_QRHSFUNC_FAIL => SolverError::QuadRhsFuncFailure,
        ENG_ILL_WHICH => SolverError::InvalidArg("no backward problem with that index"),
        ENG_NO_ADJ => SolverError::InvalidArg("adjoint checkpointing not initialized"),
        _ => SolverError::Engine { call, flag },
    }
}

/// Translate an engine status into `Ok` or the matching error.
pub(crate) fn check_flag(call: &'static str, flag: i32) -> Result<(), SolverError> {
    if flag == ENG_SUCCESS || flag == ENG_ROOT_RETURN || flag == ENG_TSTOP_RETURN {
        return Ok(());
    }
    Err(from_flag(call, flag))
}
