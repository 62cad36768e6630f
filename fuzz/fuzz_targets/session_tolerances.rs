//! Tolerance configuration must reject bad inputs with an error, never a
//! panic, for any combination of scalar and vector tolerances.

#![no_main]

use arbitrary::Arbitrary;
use fsun_session::{Iter, LinearSolverSpec, Lmm, Session, SessionConfig};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct TolInput {
    rtol: f64,
    atol: f64,
    atol_vec: Vec<f64>,
    neq: u8,
}

fuzz_target!(|input: TolInput| {
    let n = (input.neq % 8) as usize + 1;
    let config = SessionConfig {
        lmm: Lmm::Bdf,
        iter: Iter::Newton(LinearSolverSpec::Dense),
    };
    let y0 = vec![1.0; n];
    let Ok(session) = Session::init(config, 0.0, &y0, |_t, _y, mut ydot| {
        for i in 0..ydot.len() {
            ydot.set(i, 0.0);
        }
        Ok(())
    }) else {
        return;
    };
    let _ = session.ss_tolerances(input.rtol, input.atol);
    let _ = session.sv_tolerances(input.rtol, &input.atol_vec);
    session.destroy();
    let _ = session.ss_tolerances(input.rtol, input.atol);
});
