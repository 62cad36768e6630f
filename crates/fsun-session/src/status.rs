#![forbid(unsafe_code)]

//! The exception/status bridge.
//!
//! Every trampoline folds its closure's outcome through [`run_guarded`]:
//! normal return becomes status `0`, a recoverable signal becomes `1` where
//! the callback kind allows retries, and everything else is parked in the
//! session's single-slot capture and reported as `-1`. The engine's call
//! stack only ever sees the integers; the captured error is replayed once
//! control returns to the host boundary.

use std::cell::RefCell;

use fsun_engine::flags::{CB_RECOVERABLE, CB_SUCCESS, CB_UNRECOVERABLE};

use crate::error::{BoxedError, CallbackFailure, CbResult, RecoverableSignal};

/// Single-slot capture shared between a session and its trampolines.
pub(crate) type ErrorSlot = RefCell<Option<BoxedError>>;

pub(crate) fn run_guarded(slot: &ErrorSlot, recoverable_ok: bool, f: impl FnOnce() -> CbResult) -> i32 {
    match f() {
        Ok(()) => CB_SUCCESS,
        Err(CallbackFailure::Recoverable) if recoverable_ok => CB_RECOVERABLE,
        Err(CallbackFailure::Recoverable) => {
            *slot.borrow_mut() = Some(Box::new(RecoverableSignal));
            CB_UNRECOVERABLE
        }
        Err(CallbackFailure::Fatal(e)) => {
            *slot.borrow_mut() = Some(e);
            CB_UNRECOVERABLE
        }
    }
}

/// Variant for setup-style callbacks that multiplex a semantic boolean with
/// the status; on failure the boolean defaults to `false`.
pub(crate) fn run_guarded_bool(
    slot: &ErrorSlot,
    recoverable_ok: bool,
    f: impl FnOnce() -> Result<bool, CallbackFailure>,
    out: &mut bool,
) -> i32 {
    match f() {
        Ok(b) => {
            *out = b;
            CB_SUCCESS
        }
        Err(CallbackFailure::Recoverable) if recoverable_ok => {
            *out = false;
            CB_RECOVERABLE
        }
        Err(CallbackFailure::Recoverable) => {
            *out = false;
            *slot.borrow_mut() = Some(Box::new(RecoverableSignal));
            CB_UNRECOVERABLE
        }
        Err(CallbackFailure::Fatal(e)) => {
            *out = false;
            *slot.borrow_mut() = Some(e);
            CB_UNRECOVERABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;
    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for Boom {}

    #[test]
    fn test_status_success_maps_to_zero() {
        let slot = ErrorSlot::new(None);
        assert_eq!(run_guarded(&slot, true, || Ok(())), 0);
        assert!(slot.borrow().is_none());
    }

    #[test]
    fn test_status_recoverable_maps_to_one_when_allowed() {
        let slot = ErrorSlot::new(None);
        assert_eq!(
            run_guarded(&slot, true, || Err(CallbackFailure::Recoverable)),
            1
        );
        assert!(slot.borrow().is_none(), "recoverable must not be captured");
    }

    #[test]
    fn test_status_recoverable_captured_when_not_allowed() {
        let slot = ErrorSlot::new(None);
        assert_eq!(
            run_guarded(&slot, false, || Err(CallbackFailure::Recoverable)),
            -1
        );
        let captured = slot.borrow_mut().take().expect("captured");
        assert!(captured.downcast_ref::<RecoverableSignal>().is_some());
    }

    #[test]
    fn test_status_fatal_captured_and_negative() {
        let slot = ErrorSlot::new(None);
        assert_eq!(
            run_guarded(&slot, true, || Err(CallbackFailure::fatal(Boom))),
            -1
        );
        let captured = slot.borrow_mut().take().expect("captured");
        assert!(captured.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn test_status_bool_variant_defaults_false_on_failure() {
        let slot = ErrorSlot::new(None);
        let mut jcur = true;
        assert_eq!(
            run_guarded_bool(&slot, true, || Err(CallbackFailure::fatal(Boom)), &mut jcur),
            -1
        );
        assert!(!jcur);

        let mut jcur = false;
        assert_eq!(run_guarded_bool(&slot, true, || Ok(true), &mut jcur), 0);
        assert!(jcur);
    }
}
