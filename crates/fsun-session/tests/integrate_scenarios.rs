//! End-to-end scenarios driving the full stack: session -> engine ->
//! trampolines -> user closures, checked against closed-form solutions.
//!
//! Convention: test_{module}_{function}_{scenario}

use std::cell::Cell;
use std::rc::Rc;

use fsun_runtime::{TestLogEntry, TestResult, assert_close};
use fsun_session::{
    BandBlockBandwidths, Bandwidths, Iter, LinearSolverSpec, Lmm, PrecType, Session,
    SessionConfig, SolverOutcome,
};

fn bdf_dense() -> SessionConfig {
    SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Dense),
    }
}

// ── the dense-Jacobian scenario ──────────────────────────────────
//
// Three-variable linear ODE y' = A y with the upper-triangular
//   A = [[-1, 1, 0], [0, -2, 1], [0, 0, -3]]
// and an exact hand-supplied Jacobian. Closed form from the cascade:
//   y3(t) = e^{-3t}
//   y2(t) = 2 e^{-2t} - e^{-3t}
//   y1(t) = 2.5 e^{-t} - 2 e^{-2t} + 0.5 e^{-3t}

const A: [[f64; 3]; 3] = [[-1.0, 1.0, 0.0], [0.0, -2.0, 1.0], [0.0, 0.0, -3.0]];

fn linear3_exact(t: f64) -> [f64; 3] {
    [
        2.5 * (-t).exp() - 2.0 * (-2.0 * t).exp() + 0.5 * (-3.0 * t).exp(),
        2.0 * (-2.0 * t).exp() - (-3.0 * t).exp(),
        (-3.0 * t).exp(),
    ]
}

#[test]
fn test_session_advance_linear3_with_exact_dense_jacobian() {
    let jac_calls = Rc::new(Cell::new(0u32));
    let jac_calls_cb = Rc::clone(&jac_calls);

    let session = Session::init(bdf_dense(), 0.0, &[1.0, 1.0, 1.0], |_t, y, mut ydot| {
        for i in 0..3 {
            let mut s = 0.0;
            for j in 0..3 {
                s += A[i][j] * y.get(j);
            }
            ydot.set(i, s);
        }
        Ok(())
    })
    .expect("session init");
    session.ss_tolerances(1e-6, 1e-10).expect("tolerances");
    session.set_max_num_steps(100_000).expect("step budget");
    session
        .set_dense_jac_fn(move |_arg, jac| {
            jac_calls_cb.set(jac_calls_cb.get() + 1);
            for (i, row) in A.iter().enumerate() {
                for (j, aij) in row.iter().enumerate() {
                    jac.set(i, j, *aij);
                }
            }
            Ok(())
        })
        .expect("jacobian registration");

    let mut yout = [0.0; 3];
    let (t, outcome) = session.advance_normal(1.0, &mut yout).expect("advance");
    assert_eq!(outcome, SolverOutcome::Continue);
    assert_eq!(t, 1.0);
    assert!(jac_calls.get() >= 1, "Jacobian callback must have fired");
    let exact = linear3_exact(1.0);
    for (got, want) in yout.iter().zip(exact.iter()) {
        assert_close(*got, *want, 2e-2, 2e-2);
    }
    assert!(session.dls_get_num_jac_evals().expect("stat") >= 1);
    // with an exact Jacobian the engine takes no difference quotients
    assert_eq!(session.dls_get_num_rhs_evals().expect("stat"), 0);
}

// ── roots, stop time, one-step ───────────────────────────────────

#[test]
fn test_session_advance_oscillator_roots_found() {
    let config = SessionConfig {
        lmm: Lmm::Adams,
        iter: Iter::Functional,
    };
    let session = Session::init_with_roots(
        config,
        0.0,
        &[1.0, 0.0],
        |_t, y, mut ydot| {
            ydot.set(0, y.get(1));
            ydot.set(1, -y.get(0));
            Ok(())
        },
        1,
        |_t, y, mut g| {
            g.set(0, y.get(0));
            Ok(())
        },
    )
    .expect("session init");
    session.ss_tolerances(1e-7, 1e-9).expect("tolerances");
    session.set_max_num_steps(100_000).expect("step budget");

    let mut yout = [0.0, 0.0];
    let (t, outcome) = session.advance_normal(10.0, &mut yout).expect("advance");
    assert_eq!(outcome, SolverOutcome::RootsFound);
    assert_close(t, std::f64::consts::FRAC_PI_2, 1e-2, 1e-2);
    let info = session.get_root_info().expect("root info");
    assert_eq!(info, vec![-1]);
    assert!(session.get_num_g_evals().expect("stat") > 0);
}

#[test]
fn test_session_advance_stop_time_reached() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session.set_stop_time(0.25).expect("tstop");
    let mut yout = [0.0];
    let (t, outcome) = session.advance_normal(5.0, &mut yout).expect("advance");
    assert_eq!(outcome, SolverOutcome::StopTimeReached);
    assert_close(t, 0.25, 1e-12, 1e-12);
    assert_close(yout[0], (-0.25f64).exp(), 1e-3, 1e-3);
}

#[test]
fn test_session_advance_one_step_mode_stops_after_one_step() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    let mut yout = [0.0];
    let (t1, outcome) = session.advance_one_step(1.0, &mut yout).expect("step");
    assert_eq!(outcome, SolverOutcome::Continue);
    assert_eq!(session.get_num_steps().expect("stat"), 1);
    assert!(t1 > 0.0 && t1 < 1.0);
    // a second one-step call continues from where the first stopped
    let (t2, _) = session.advance_one_step(1.0, &mut yout).expect("step");
    assert!(t2 > t1);
}

// ── tolerances, error weights, diagnostics ───────────────────────

#[test]
fn test_session_sv_tolerances_per_component() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0, 1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        ydot.set(1, -2.0 * y.get(1));
        Ok(())
    })
    .expect("session init");
    session
        .sv_tolerances(1e-5, &[1e-8, 1e-10])
        .expect("sv tolerances");
    let mut yout = [0.0, 0.0];
    session.set_max_num_steps(100_000).expect("step budget");
    let (t, _) = session.advance_normal(1.0, &mut yout).expect("advance");
    assert_eq!(t, 1.0);
    assert_close(yout[0], (-1.0f64).exp(), 5e-3, 5e-3);
    assert_close(yout[1], (-2.0f64).exp(), 5e-3, 5e-3);
}

#[test]
fn test_session_sv_tolerances_wrong_length_rejected() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0, 1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        ydot.set(1, -y.get(1));
        Ok(())
    })
    .expect("session init");
    assert!(session.sv_tolerances(1e-5, &[1e-8]).is_err());
}

#[test]
fn test_session_wf_tolerances_custom_error_weights() {
    let ewt_calls = Rc::new(Cell::new(0u32));
    let ewt_calls_cb = Rc::clone(&ewt_calls);
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session
        .wf_tolerances(move |y, mut ewt| {
            ewt_calls_cb.set(ewt_calls_cb.get() + 1);
            for i in 0..y.len() {
                ewt.set(i, 1.0 / (1e-4 * y.get(i).abs() + 1e-8));
            }
            Ok(())
        })
        .expect("wf tolerances");
    let mut yout = [0.0];
    let (t, _) = session.advance_normal(1.0, &mut yout).expect("advance");
    assert_eq!(t, 1.0);
    assert!(ewt_calls.get() > 0, "weight function must have been used");
    let weights = session.get_err_weights().expect("weights");
    assert!(weights[0] > 0.0);
}

#[test]
fn test_session_err_handler_sees_engine_warnings() {
    let seen = Rc::new(Cell::new(0u32));
    let seen_cb = Rc::clone(&seen);
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session
        .set_err_handler(move |details| {
            assert_eq!(details.module_name, "FSUNENGINE");
            assert!(!details.error_message.is_empty());
            seen_cb.set(seen_cb.get() + 1);
        })
        .expect("handler");
    session.set_max_num_steps(2).expect("budget");
    let mut yout = [0.0];
    let err = session.advance_normal(100.0, &mut yout).unwrap_err();
    assert!(matches!(err, fsun_session::SolverError::TooMuchWork));
    assert!(seen.get() > 0, "handler must have received the report");
}

#[test]
fn test_session_error_file_receives_diagnostics() {
    let path = std::env::temp_dir().join("fsun_session_errfile_test.log");
    let _ = std::fs::remove_file(&path);
    {
        let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
            ydot.set(0, -y.get(0));
            Ok(())
        })
        .expect("session init");
        session.set_error_file(&path, true).expect("error file");
        session.set_max_num_steps(2).expect("budget");
        let mut yout = [0.0];
        let _ = session.advance_normal(100.0, &mut yout);
    }
    let contents = std::fs::read_to_string(&path).expect("file written");
    assert!(!contents.is_empty());
    let _ = std::fs::remove_file(&path);
}

// ── band / Krylov configurations ─────────────────────────────────

#[test]
fn test_linsolv_band_jacobian_callback_used() {
    const N: usize = 8;
    let jac_calls = Rc::new(Cell::new(0u32));
    let jac_calls_cb = Rc::clone(&jac_calls);
    let config = SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Band(Bandwidths {
            mupper: 1,
            mlower: 1,
        })),
    };
    let y0 = vec![1.0; N];
    let session = Session::init(config, 0.0, &y0, |_t, y, mut ydot| {
        for i in 0..N {
            let left = if i == 0 { 0.0 } else { y.get(i - 1) };
            let right = if i == N - 1 { 0.0 } else { y.get(i + 1) };
            ydot.set(i, left - 2.0 * y.get(i) + right);
        }
        Ok(())
    })
    .expect("session init");
    session
        .set_band_jac_fn(move |mupper, mlower, _arg, jac| {
            assert_eq!((mupper, mlower), (1, 1));
            jac_calls_cb.set(jac_calls_cb.get() + 1);
            for j in 0..N {
                jac.set(j, j, -2.0);
                if j > 0 {
                    jac.set(j, j - 1, 1.0);
                    jac.set(j - 1, j, 1.0);
                }
            }
            Ok(())
        })
        .expect("band jac");
    let mut yout = vec![0.0; N];
    let (t, _) = session.advance_normal(0.5, &mut yout).expect("advance");
    assert_eq!(t, 0.5);
    assert!(jac_calls.get() >= 1);
    for (a, b) in yout.iter().zip(y0.iter()) {
        assert!(a.abs() < b.abs() + 1e-12, "diffusion must not grow");
    }
}

#[test]
fn test_linsolv_krylov_user_preconditioner_and_jtimes_invoked() {
    let psolve_calls = Rc::new(Cell::new(0u32));
    let jtimes_calls = Rc::new(Cell::new(0u32));
    let config = SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Krylov {
            pretype: PrecType::Left,
            maxl: 5,
        }),
    };
    let session = Session::init(config, 0.0, &[1.0, 1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        ydot.set(1, -5.0 * y.get(1));
        Ok(())
    })
    .expect("session init");
    {
        let psolve_calls = Rc::clone(&psolve_calls);
        session
            .set_preconditioner_with_setup(
                |_arg, _jok, _gamma| Ok(true),
                move |_arg, solve_arg, mut z| {
                    psolve_calls.set(psolve_calls.get() + 1);
                    // identity preconditioner
                    for i in 0..z.len() {
                        z.set(i, solve_arg.rhs.get(i));
                    }
                    Ok(())
                },
            )
            .expect("preconditioner");
    }
    {
        let jtimes_calls = Rc::clone(&jtimes_calls);
        session
            .set_jac_times_vec_fn(move |_arg, v, mut jv| {
                jtimes_calls.set(jtimes_calls.get() + 1);
                jv.set(0, -v.get(0));
                jv.set(1, -5.0 * v.get(1));
                Ok(())
            })
            .expect("jtimes");
    }
    let mut yout = [0.0, 0.0];
    session.set_max_num_steps(100_000).expect("budget");
    let (t, _) = session.advance_normal(1.0, &mut yout).expect("advance");
    assert_eq!(t, 1.0);
    assert!(psolve_calls.get() > 0, "preconditioner solve must run");
    assert!(jtimes_calls.get() > 0, "jtimes must run");
    assert_close(yout[0], (-1.0f64).exp(), 5e-3, 1e-2);
    assert!(session.spils_get_num_prec_solves().expect("stat") > 0);
    assert!(session.spils_get_num_jtimes_evals().expect("stat") > 0);
    assert!(session.spils_get_num_prec_evals().expect("stat") > 0);
}

#[test]
fn test_linsolv_krylov_bbd_preconditioner_drives_local_fn() {
    const N: usize = 8;
    let local_calls = Rc::new(Cell::new(0u32));
    let comm_calls = Rc::new(Cell::new(0u32));
    let session = {
        let config = SessionConfig {
            lmm: Lmm::Bdf,
            iter: Iter::Newton(LinearSolverSpec::Krylov {
                pretype: PrecType::Left,
                maxl: 5,
            }),
        };
        Session::init(config, 0.0, &vec![1.0; N], |_t, y, mut ydot| {
            for i in 0..N {
                let left = if i == 0 { 0.0 } else { y.get(i - 1) };
                let right = if i == N - 1 { 0.0 } else { y.get(i + 1) };
                ydot.set(i, left - 2.0 * y.get(i) + right);
            }
            Ok(())
        })
        .expect("session init")
    };
    {
        let local_calls = Rc::clone(&local_calls);
        let comm_calls = Rc::clone(&comm_calls);
        session
            .attach_krylov_bbd_with_comm(
                PrecType::Left,
                5,
                BandBlockBandwidths {
                    mudq: 1,
                    mldq: 1,
                    mukeep: 1,
                    mlkeep: 1,
                },
                None,
                move |_t, y, mut g| {
                    local_calls.set(local_calls.get() + 1);
                    for i in 0..N {
                        let left = if i == 0 { 0.0 } else { y.get(i - 1) };
                        let right = if i == N - 1 { 0.0 } else { y.get(i + 1) };
                        g.set(i, left - 2.0 * y.get(i) + right);
                    }
                    Ok(())
                },
                move |_t, _y| {
                    comm_calls.set(comm_calls.get() + 1);
                    Ok(())
                },
            )
            .expect("bbd attach");
    }
    let mut yout = vec![0.0; N];
    session.set_max_num_steps(100_000).expect("budget");
    let (t, _) = session.advance_normal(0.5, &mut yout).expect("advance");
    assert_eq!(t, 0.5);
    assert!(local_calls.get() > 0, "BBD local function must run");
    assert!(comm_calls.get() > 0, "BBD comm function must run");
    assert!(session.bbd_get_num_gloc_evals().expect("stat") > 0);
    let (lenrw, leniw) = session.bbd_get_work_space().expect("workspace");
    assert!(lenrw > 0 && leniw > 0);
}

// ── interpolation and statistics surface ─────────────────────────

#[test]
fn test_session_get_dky_derivative_of_decay() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    let mut yout = [0.0];
    let (t, _) = session.advance_normal(1.0, &mut yout).expect("advance");
    let val = session.get_dky(t, 0).expect("value");
    assert_close(val[0], yout[0], 1e-8, 1e-8);
    let slope = session.get_dky(t, 1).expect("slope");
    assert_close(slope[0], -yout[0], 1e-2, 5e-2);
}

#[test]
fn test_session_statistics_surface_is_complete() {
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    let mut yout = [0.0];
    session.advance_normal(1.0, &mut yout).expect("advance");

    let stats = session.get_integrator_stats().expect("stats");
    assert!(stats.steps > 0);
    assert_eq!(stats.steps, session.get_num_steps().expect("steps"));
    assert_eq!(
        stats.rhs_evals,
        session.get_num_rhs_evals().expect("rhs evals")
    );
    assert!(session.get_num_lin_solv_setups().expect("setups") > 0);
    assert!(session.get_last_order().expect("order") >= 1);
    assert!(session.get_actual_init_step().expect("h0") != 0.0);
    assert!(session.get_last_step().expect("hlast") != 0.0);
    assert!(session.get_current_time().expect("tcur") >= 1.0);
    assert!(session.get_tol_scale_factor().expect("tolsf") >= 1.0);
    assert!(session.get_num_nonlin_solv_iters().expect("nni") > 0);
    let (lenrw, leniw) = session.get_work_space().expect("workspace");
    assert!(lenrw > 0 && leniw > 0);
    let ewt = session.get_err_weights().expect("ewt");
    assert!(ewt[0] > 0.0);
    let ele = session.get_est_local_errors().expect("ele");
    assert_eq!(ele.len(), 1);

    let entry = TestLogEntry::new(
        "test_session_statistics_surface_is_complete",
        "fsun_session",
        format!("steps={} nfe={}", stats.steps, stats.rhs_evals),
    )
    .with_result(TestResult::Pass);
    assert!(entry.to_json_line().contains("\"pass\""));
}

// ── adjoint scenarios ────────────────────────────────────────────

#[test]
fn test_adjoint_backward_integration_of_decay_adjoint() {
    // forward: y' = -y, y(0) = 1. adjoint: lambda' = lambda (running
    // backward from lambda(1) = 1), so lambda(0) = e^{-1}.
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session.adj_init(5).expect("adj init");
    let mut yout = [0.0];
    let (t, ncheck) = session.forward_normal(1.0, &mut yout).expect("forward");
    assert_eq!(t, 1.0);
    assert!(ncheck > 0, "forward pass must have checkpointed");

    let bs = session
        .init_backward(Lmm::Bdf, 1.0, &[1.0], |_t, _y, yb, mut ybdot| {
            ybdot.set(0, yb.get(0));
            Ok(())
        })
        .expect("init backward");
    bs.attach_dense().expect("backward dense");
    bs.ss_tolerances(1e-4, 1e-8).expect("backward tolerances");

    session.backward_normal(0.0).expect("backward");
    let (tb, yb) = bs.get().expect("backward state");
    assert_eq!(tb, 0.0);
    assert_close(yb[0], (-1.0f64).exp(), 2e-2, 5e-2);
}

#[test]
fn test_adjoint_backward_quadrature_accumulates_integral() {
    // quadrature of the forward solution: |int_0^1 e^{-t} dt| = 1 - e^{-1}
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session.adj_init(5).expect("adj init");
    let mut yout = [0.0];
    session.forward_normal(1.0, &mut yout).expect("forward");

    let bs = session
        .init_backward(Lmm::Bdf, 1.0, &[1.0], |_t, _y, yb, mut ybdot| {
            ybdot.set(0, yb.get(0));
            Ok(())
        })
        .expect("init backward");
    bs.attach_dense().expect("backward dense");
    bs.quad_init(&[0.0], |_t, y, _yb, mut qdot| {
        qdot.set(0, y.get(0));
        Ok(())
    })
    .expect("quad init");

    session.backward_normal(0.0).expect("backward");
    let (_, yq) = bs.quad_get().expect("quadrature");
    let expected = 1.0 - (-1.0f64).exp();
    assert_close(yq[0].abs(), expected, 5e-2, 5e-2);
    assert!(bs.num_quad_rhs_evals().expect("stat") > 0);
    let stats = bs.get_integrator_stats().expect("backward stats");
    assert!(stats.steps > 0);
}

#[test]
fn test_adjoint_backward_with_dense_jacobian_callback() {
    let jac_calls = Rc::new(Cell::new(0u32));
    let jac_calls_cb = Rc::clone(&jac_calls);
    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session.adj_init(5).expect("adj init");
    let mut yout = [0.0];
    session.forward_normal(1.0, &mut yout).expect("forward");

    let bs = session
        .init_backward(Lmm::Bdf, 1.0, &[1.0], |_t, _y, yb, mut ybdot| {
            ybdot.set(0, yb.get(0));
            Ok(())
        })
        .expect("init backward");
    bs.attach_dense().expect("backward dense");
    bs.set_dense_jac_fn(move |_arg, jac| {
        jac_calls_cb.set(jac_calls_cb.get() + 1);
        jac.set(0, 0, 1.0);
        Ok(())
    })
    .expect("backward jacobian");

    session.backward_normal(0.0).expect("backward");
    assert!(jac_calls.get() >= 1, "backward Jacobian callback must fire");
    let (_, yb) = bs.get().expect("state");
    assert_close(yb[0], (-1.0f64).exp(), 2e-2, 5e-2);
}

#[test]
fn test_adjoint_backward_rhs_failure_replays_at_backward_call() {
    #[derive(Debug)]
    struct AdjointBoom;
    impl std::fmt::Display for AdjointBoom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "adjoint boom")
        }
    }
    impl std::error::Error for AdjointBoom {}

    let session = Session::init(bdf_dense(), 0.0, &[1.0], |_t, y, mut ydot| {
        ydot.set(0, -y.get(0));
        Ok(())
    })
    .expect("session init");
    session.adj_init(5).expect("adj init");
    let mut yout = [0.0];
    session.forward_normal(1.0, &mut yout).expect("forward");

    let _bs = session
        .init_backward(Lmm::Bdf, 1.0, &[1.0], |_t, _y, _yb, _ybdot| {
            Err(fsun_session::CallbackFailure::fatal(AdjointBoom))
        })
        .expect("init backward");
    let err = session.backward_normal(0.0).unwrap_err();
    assert!(
        err.callback_source::<AdjointBoom>().is_some(),
        "backward host error must replay at the backward boundary, got {err:?}"
    );
}
