//! Drive the engine through its raw fn-pointer interface, the way a binding
//! layer would, and check the integration results against closed forms.

use std::cell::Cell;

use fsun_engine::flags::*;
use fsun_engine::{Bandwidths, EngineMem, Lmm, PrecType, StepMode};
use fsun_nvec::RealBuffer;
use fsun_runtime::assert_close;

// exponential decay y' = -y
fn decay_rhs(_t: f64, y: &RealBuffer, ydot: &RealBuffer, _user: u64) -> i32 {
    let v = y.to_vec();
    ydot.with_mut(|d| {
        for (di, yi) in d.iter_mut().zip(v.iter()) {
            *di = -yi;
        }
    });
    CB_SUCCESS
}

// harmonic oscillator y'' + y = 0 as a first-order system
fn oscillator_rhs(_t: f64, y: &RealBuffer, ydot: &RealBuffer, _user: u64) -> i32 {
    let v = y.to_vec();
    ydot.with_mut(|d| {
        d[0] = v[1];
        d[1] = -v[0];
    });
    CB_SUCCESS
}

thread_local! {
    static ROOT_HITS: Cell<u64> = const { Cell::new(0) };
}

fn oscillator_root(_t: f64, y: &RealBuffer, gout: &RealBuffer, _user: u64) -> i32 {
    ROOT_HITS.with(|c| c.set(c.get() + 1));
    let v = y.to_vec();
    gout.with_mut(|g| g[0] = v[0]);
    CB_SUCCESS
}

fn new_decay_problem() -> EngineMem {
    let mut mem = EngineMem::create(Lmm::Bdf);
    assert_eq!(mem.init(decay_rhs, 0.0, &[1.0]), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-6, 1e-10), ENG_SUCCESS);
    assert_eq!(mem.set_max_num_steps(100_000), ENG_SUCCESS);
    assert_eq!(mem.attach_dense(), ENG_SUCCESS);
    mem
}

#[test]
fn test_engine_advance_decay_reaches_tout_exactly() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (t, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, 1.0);
    assert_close(yout[0], (-1.0f64).exp(), 1e-4, 1e-3);
    assert!(mem.get_num_steps() > 0);
    assert!(mem.get_num_rhs_evals() > mem.get_num_steps());
}

#[test]
fn test_engine_advance_one_step_takes_single_step() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (t1, flag) = mem.advance(1.0, &mut yout, StepMode::OneStep);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(mem.get_num_steps(), 1);
    assert!(t1 > 0.0 && t1 <= 1.0);
}

#[test]
fn test_engine_advance_adams_functional_oscillator() {
    let mut mem = EngineMem::create(Lmm::Adams);
    assert_eq!(mem.init(oscillator_rhs, 0.0, &[1.0, 0.0]), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-7, 1e-9), ENG_SUCCESS);
    mem.set_functional();
    let mut yout = [0.0, 0.0];
    let half_pi = std::f64::consts::FRAC_PI_2;
    let (t, flag) = mem.advance(half_pi, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, half_pi);
    // y(pi/2) = (cos, -sin)(pi/2) = (0, -1)
    assert_close(yout[0], 0.0, 5e-3, 0.0);
    assert_close(yout[1], -1.0, 5e-3, 1e-2);
}

#[test]
fn test_engine_root_detected_at_quarter_period() {
    ROOT_HITS.with(|c| c.set(0));
    let mut mem = EngineMem::create(Lmm::Adams);
    assert_eq!(mem.init(oscillator_rhs, 0.0, &[1.0, 0.0]), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-7, 1e-9), ENG_SUCCESS);
    mem.set_functional();
    assert_eq!(mem.root_init(1, oscillator_root), ENG_SUCCESS);
    let mut yout = [0.0, 0.0];
    let (t, flag) = mem.advance(10.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_ROOT_RETURN);
    // first zero of cos(t) is at pi/2
    assert_close(t, std::f64::consts::FRAC_PI_2, 1e-2, 1e-2);
    let mut info = [0i32];
    assert_eq!(mem.get_root_info(&mut info), ENG_SUCCESS);
    assert_eq!(info[0], -1, "cos crosses zero going down");
    assert!(ROOT_HITS.with(Cell::get) > 0);
    assert!(mem.get_num_g_evals() > 0);
}

#[test]
fn test_engine_tstop_halts_integration() {
    let mut mem = new_decay_problem();
    assert_eq!(mem.set_stop_time(0.5), ENG_SUCCESS);
    let mut yout = [0.0];
    let (t, flag) = mem.advance(2.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_TSTOP_RETURN);
    assert_close(t, 0.5, 1e-12, 1e-12);
    assert_close(yout[0], (-0.5f64).exp(), 1e-4, 1e-3);
}

#[test]
fn test_engine_advance_rejects_too_close_tout() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (_, flag) = mem.advance(0.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_TOO_CLOSE);
}

#[test]
fn test_engine_advance_too_much_work_with_tiny_step_budget() {
    let mut mem = new_decay_problem();
    assert_eq!(mem.set_max_num_steps(2), ENG_SUCCESS);
    let mut yout = [0.0];
    let (t, flag) = mem.advance(1000.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_TOO_MUCH_WORK);
    assert!(t < 1000.0);
}

#[test]
fn test_engine_get_dky_matches_interpolant_endpoints() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (t, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    let mut dky = [0.0];
    assert_eq!(mem.get_dky(t, 0, &mut dky), ENG_SUCCESS);
    assert_close(dky[0], yout[0], 1e-6, 1e-6);
    // first derivative of e^-t is -e^-t
    assert_eq!(mem.get_dky(t, 1, &mut dky), ENG_SUCCESS);
    assert_close(dky[0], -yout[0], 1e-3, 1e-2);
    assert_eq!(mem.get_dky(t, 9, &mut dky), ENG_BAD_K);
    assert_eq!(mem.get_dky(t + 100.0, 0, &mut dky), ENG_BAD_T);
}

#[test]
fn test_engine_reinit_keeps_solver_but_resets_counters() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (_, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert!(mem.get_num_steps() > 0);

    assert_eq!(mem.reinit(0.0, &[2.0]), ENG_SUCCESS);
    assert_eq!(mem.get_num_steps(), 0);
    let (t, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, 1.0);
    assert_close(yout[0], 2.0 * (-1.0f64).exp(), 1e-4, 1e-3);
}

#[test]
fn test_engine_reinit_rejects_wrong_size() {
    let mut mem = new_decay_problem();
    assert_eq!(mem.reinit(0.0, &[1.0, 2.0]), ENG_ILL_INPUT);
}

#[test]
fn test_engine_band_solver_heat_equation() {
    // method-of-lines heat equation: tridiagonal Jacobian
    const N: usize = 12;
    fn heat_rhs(_t: f64, y: &RealBuffer, ydot: &RealBuffer, _user: u64) -> i32 {
        let v = y.to_vec();
        ydot.with_mut(|d| {
            for i in 0..N {
                let left = if i == 0 { 0.0 } else { v[i - 1] };
                let right = if i == N - 1 { 0.0 } else { v[i + 1] };
                d[i] = left - 2.0 * v[i] + right;
            }
        });
        CB_SUCCESS
    }
    let y0: Vec<f64> = (0..N)
        .map(|i| (std::f64::consts::PI * (i + 1) as f64 / (N + 1) as f64).sin())
        .collect();
    let mut mem = EngineMem::create(Lmm::Bdf);
    assert_eq!(mem.init(heat_rhs, 0.0, &y0), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-4, 1e-8), ENG_SUCCESS);
    assert_eq!(mem.set_max_num_steps(100_000), ENG_SUCCESS);
    let bw = Bandwidths {
        mupper: 1,
        mlower: 1,
    };
    assert_eq!(mem.attach_band(bw.mupper, bw.mlower), ENG_SUCCESS);
    let mut yout = vec![0.0; N];
    let (t, flag) = mem.advance(0.5, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, 0.5);
    // the dominant mode decays like exp(-lambda t); all values shrink
    for (a, b) in yout.iter().zip(y0.iter()) {
        assert!(a.abs() < b.abs(), "heat solution must decay");
    }
    assert!(mem.dls_get_num_rhs_evals().unwrap() > 0, "difference-quotient band Jacobian used");
}

#[test]
fn test_engine_diag_solver_decay_system() {
    fn rhs(_t: f64, y: &RealBuffer, ydot: &RealBuffer, _user: u64) -> i32 {
        let v = y.to_vec();
        ydot.with_mut(|d| {
            d[0] = -v[0];
            d[1] = -10.0 * v[1];
        });
        CB_SUCCESS
    }
    let mut mem = EngineMem::create(Lmm::Bdf);
    assert_eq!(mem.init(rhs, 0.0, &[1.0, 1.0]), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-4, 1e-8), ENG_SUCCESS);
    assert_eq!(mem.set_max_num_steps(100_000), ENG_SUCCESS);
    assert_eq!(mem.attach_diag(), ENG_SUCCESS);
    let mut yout = [0.0, 0.0];
    let (t, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, 1.0);
    assert_close(yout[0], (-1.0f64).exp(), 5e-3, 1e-2);
    assert_close(yout[1], (-10.0f64).exp(), 5e-3, 5e-1);
    assert!(mem.diag_get_num_rhs_evals().unwrap() > 0);
}

#[test]
fn test_engine_krylov_unpreconditioned_decay() {
    let mut mem = EngineMem::create(Lmm::Bdf);
    assert_eq!(mem.init(decay_rhs, 0.0, &[1.0]), ENG_SUCCESS);
    assert_eq!(mem.set_ss_tolerances(1e-4, 1e-8), ENG_SUCCESS);
    assert_eq!(mem.set_max_num_steps(100_000), ENG_SUCCESS);
    assert_eq!(mem.attach_krylov(PrecType::None, 5), ENG_SUCCESS);
    let mut yout = [0.0];
    let (t, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    assert_eq!(t, 1.0);
    assert_close(yout[0], (-1.0f64).exp(), 1e-4, 1e-2);
    assert!(mem.spils_get_num_lin_iters().unwrap() > 0);
}

#[test]
fn test_engine_stats_record_is_serializable() {
    let mut mem = new_decay_problem();
    let mut yout = [0.0];
    let (_, flag) = mem.advance(1.0, &mut yout, StepMode::Normal);
    assert_eq!(flag, ENG_SUCCESS);
    let stats = mem.get_integrator_stats();
    assert!(stats.steps > 0);
    assert!(stats.internal_time >= 1.0);
    assert!(stats.last_step_size != 0.0);
    let json = serde_json::to_string(&stats).expect("stats serialize");
    assert!(json.contains("\"steps\""));
}

#[test]
fn test_engine_callbacks_unregistered_linear_solver_fails_cleanly() {
    let mut mem = EngineMem::create(Lmm::Bdf);
    assert_eq!(mem.init(decay_rhs, 0.0, &[1.0]), ENG_SUCCESS);
    // Newton requested implicitly by attaching nothing: functional default
    // is fine, but forcing Newton without a solver must fail loudly.
    assert_eq!(mem.attach_dense(), ENG_SUCCESS);
    // dense stats available, spils stats are not
    assert!(mem.dls_get_num_jac_evals().is_some());
    assert!(mem.spils_get_num_lin_iters().is_none());
}
