//! Property tests for the session layer.
//!
//! Convention: test_{module}_{function}_{scenario}
//!
//! Seed replay: `PROPTEST_CASES=500 cargo test -p fsun-session --test property_tests`

use std::cell::Cell;
use std::rc::Rc;

use fsun_session::{
    CallbackFailure, Iter, LinearSolverSpec, Lmm, Session, SessionConfig, SolverError,
    SolverOutcome,
};
use proptest::prelude::*;

fn bdf_dense() -> SessionConfig {
    SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Dense),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // For any moderate decay rate and initial value, `advance_normal`
    // reaches the requested time exactly and lands near the closed form.
    #[test]
    fn test_session_advance_decay_matches_closed_form(
        lambda in 0.1f64..4.0,
        y0 in 0.25f64..4.0,
    ) {
        let session = Session::init(bdf_dense(), 0.0, &[y0], move |_t, y, mut ydot| {
            ydot.set(0, -lambda * y.get(0));
            Ok(())
        })
        .expect("session init");
        session.set_max_num_steps(100_000).expect("budget");
        let mut yout = [0.0];
        let (t, outcome) = session.advance_normal(1.0, &mut yout).expect("advance");
        prop_assert_eq!(outcome, SolverOutcome::Continue);
        prop_assert_eq!(t, 1.0);
        let expected = y0 * (-lambda).exp();
        prop_assert!(
            (yout[0] - expected).abs() <= 1e-2 + 5e-2 * expected.abs(),
            "y(1) = {}, expected {}", yout[0], expected
        );
    }

    // Valid tolerance pairs are always accepted; negative members are
    // always rejected as illegal input.
    #[test]
    fn test_session_ss_tolerances_sign_contract(
        rtol in -1.0f64..1.0,
        atol in -1.0f64..1.0,
    ) {
        let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
            ydot.set(0, -y.get(0));
            Ok(())
        })
        .expect("session init");
        let result = session.ss_tolerances(rtol, atol);
        if rtol < 0.0 || atol < 0.0 {
            prop_assert!(matches!(result, Err(SolverError::IllInput)));
        } else {
            prop_assert!(result.is_ok());
        }
    }

    // Any finite number of leading recoverable RHS failures is retried
    // away without surfacing to the host.
    #[test]
    fn test_status_recoverable_rhs_failures_always_retried(nfail in 0u32..4) {
        let remaining = Rc::new(Cell::new(nfail));
        let remaining_cb = Rc::clone(&remaining);
        let session = Session::init(bdf_dense(), 0.0, &[1.0], move |_t, y, mut ydot| {
            if remaining_cb.get() > 0 {
                remaining_cb.set(remaining_cb.get() - 1);
                return Err(CallbackFailure::Recoverable);
            }
            ydot.set(0, -y.get(0));
            Ok(())
        })
        .expect("session init");
        let mut yout = [0.0];
        let (t, outcome) = session.advance_normal(1.0, &mut yout).expect("advance");
        prop_assert_eq!(outcome, SolverOutcome::Continue);
        prop_assert_eq!(t, 1.0);
        prop_assert_eq!(remaining.get(), 0);
    }

    // A destroyed session refuses every engine-entering operation with
    // SessionClosed, regardless of arguments.
    #[test]
    fn test_session_destroyed_operations_always_session_closed(
        tout in -10.0f64..10.0,
        k in 0usize..4,
    ) {
        let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
            ydot.set(0, -y.get(0));
            Ok(())
        })
        .expect("session init");
        session.destroy();
        let mut yout = [0.0];
        prop_assert!(matches!(
            session.advance_normal(tout, &mut yout),
            Err(SolverError::SessionClosed)
        ));
        prop_assert!(matches!(session.get_dky(tout, k), Err(SolverError::SessionClosed)));
        prop_assert!(matches!(session.get_num_steps(), Err(SolverError::SessionClosed)));
    }

    // The interpolant is consistent with the advance output anywhere in
    // the final step.
    #[test]
    fn test_session_get_dky_interpolant_brackets_solution(frac in 0.0f64..1.0) {
        let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
            ydot.set(0, -y.get(0));
            Ok(())
        })
        .expect("session init");
        let mut yout = [0.0];
        let (t, _) = session.advance_normal(1.0, &mut yout).expect("advance");
        let hlast = session.get_last_step().expect("hlast");
        let tcur = session.get_current_time().expect("tcur");
        let tq = (tcur - hlast).max(t - hlast) * frac + (1.0 - frac) * tcur.min(t);
        if let Ok(val) = session.get_dky(tq, 0) {
            prop_assert!(val[0].is_finite());
            prop_assert!(val[0] > 0.0, "decay solution stays positive, got {}", val[0]);
        }
    }
}
