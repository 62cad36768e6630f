#![forbid(unsafe_code)]

//! Adjoint support: checkpointed forward integration, interpolation of the
//! forward trajectory, and backward problems.
//!
//! A backward problem is a full `EngineMem` nested inside its parent,
//! distinguished only by its right-hand-side dispatch (which receives the
//! interpolated forward state) and addressed by its index in the parent's
//! list. The engine never hands out a separate handle for it.

use std::cell::RefCell;
use std::rc::Rc;

use fsun_nvec::RealBuffer;

use crate::flags::*;
use crate::lsolve::{
    BandJacDispatch, DenseJacDispatch, JacTimesDispatch, PrecSetupDispatch, PrecSolveDispatch,
};
use crate::mem::{EngineMem, FwdCtx, Lmm, RhsDispatch, StepMode};
use crate::stepper::hermite_eval;
use crate::types::{
    BandJacFnB, DenseJacFnB, JacTimesFnB, PrecSetupFnB, PrecSolveFnB, PrecType, QuadRhsFnB, RhsFnB,
    UserToken,
};

/// One stored forward point.
#[derive(Debug, Clone)]
struct CheckPoint {
    t: f64,
    y: Vec<f64>,
    ydot: Vec<f64>,
}

/// The recorded forward trajectory, shared with every backward problem.
#[derive(Debug, Default)]
pub(crate) struct History {
    points: Vec<CheckPoint>,
}

impl History {
    pub(crate) fn clear(&mut self) {
        self.points.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.points.len()
    }

    fn record(&mut self, t: f64, y: Vec<f64>, ydot: Vec<f64>) {
        self.points.push(CheckPoint { t, y, ydot });
    }

    /// Start of the recorded interval (the forward problem's t0).
    pub(crate) fn earliest_t(&self) -> Option<f64> {
        self.points.first().map(|p| p.t)
    }

    /// Hermite interpolation of the forward state at `t`. Returns false when
    /// no forward history covers `t`.
    pub(crate) fn interp(&self, t: f64, out: &RealBuffer) -> bool {
        if self.points.is_empty() {
            return false;
        }
        let first = &self.points[0];
        let last = &self.points[self.points.len() - 1];
        let (lo, hi) = if first.t <= last.t {
            (first.t, last.t)
        } else {
            (last.t, first.t)
        };
        let fuzz = 1e-10 * (hi - lo).abs().max(1.0);
        if t < lo - fuzz || t > hi + fuzz {
            return false;
        }
        if self.points.len() == 1 {
            out.copy_from_slice(&first.y);
            return true;
        }
        // locate the bracketing pair (points are monotone in t)
        let increasing = first.t <= last.t;
        let mut idx = self.points.len() - 1;
        for (k, w) in self.points.windows(2).enumerate() {
            let inside = if increasing {
                t <= w[1].t
            } else {
                t >= w[1].t
            };
            if inside {
                idx = k + 1;
                break;
            }
        }
        let p0 = &self.points[idx - 1];
        let p1 = &self.points[idx];
        let mut tmp = vec![0.0; p0.y.len()];
        hermite_eval(p0.t, &p0.y, &p0.ydot, p1.t, &p1.y, &p1.ydot, t, 0, &mut tmp);
        out.copy_from_slice(&tmp);
        true
    }
}

/// Parent-side adjoint bookkeeping.
#[derive(Debug)]
pub(crate) struct AdjointCtl {
    pub(crate) steps_per_check: usize,
    pub(crate) hist: Rc<RefCell<History>>,
}

/// Quadrature extension on a backward problem, integrated alongside the
/// backward state without error control.
#[derive(Debug)]
pub(crate) struct QuadCtl {
    pub(crate) f: QuadRhsFnB,
    pub(crate) yq: Vec<f64>,
    pub(crate) qdot: RealBuffer,
    pub(crate) nqe: u64,
}

impl EngineMem {
    // ── forward (checkpointing) side ─────────────────────────────

    /// Enable adjoint checkpointing ahead of `forward` calls.
    pub fn adj_init(&mut self, steps_per_check: usize) -> i32 {
        if !self.initialized {
            return ENG_NO_MALLOC;
        }
        if steps_per_check == 0 {
            return ENG_ILL_INPUT;
        }
        self.adj = Some(AdjointCtl {
            steps_per_check,
            hist: Rc::new(RefCell::new(History::default())),
        });
        ENG_SUCCESS
    }

    pub(crate) fn record_checkpoint(&mut self) {
        if let Some(adj) = &self.adj {
            adj.hist
                .borrow_mut()
                .record(self.tn, self.y.to_vec(), self.ydot.to_vec());
        }
    }

    /// Forward integration with checkpointing; the extra return value is the
    /// number of checkpoint groups recorded so far.
    pub fn forward(&mut self, tout: f64, yout: &mut [f64], mode: StepMode) -> (f64, i32, i32) {
        if self.adj.is_none() {
            return (self.tn, 0, ENG_NO_ADJ);
        }
        let (tret, flag) = self.advance_inner(tout, yout, mode, true);
        let ncheck = self
            .adj
            .as_ref()
            .map_or(0, |a| (a.hist.borrow().len() / a.steps_per_check) as i32);
        (tret, ncheck, flag)
    }

    // ── backward problems ────────────────────────────────────────

    /// Create and initialize a backward problem; returns `(which, flag)`.
    pub fn init_backward(
        &mut self,
        lmm: Lmm,
        rhs: RhsFnB,
        tb0: f64,
        yb0: &[f64],
    ) -> (usize, i32) {
        let Some(adj) = &self.adj else {
            return (0, ENG_NO_ADJ);
        };
        let hist = Rc::clone(&adj.hist);
        let mut child = EngineMem::create(lmm);
        child.rhs = Some(RhsDispatch::Bwd(rhs));
        child.fwd_ctx = Some(FwdCtx {
            hist,
            yfwd: RealBuffer::new(self.n),
        });
        let flag = child.init_state(tb0, yb0);
        if flag != ENG_SUCCESS {
            return (0, flag);
        }
        let which = self.backwards.len();
        self.backwards.push(child);
        (which, ENG_SUCCESS)
    }

    pub(crate) fn backward_mut(&mut self, which: usize) -> Result<&mut EngineMem, i32> {
        self.backwards.get_mut(which).ok_or(ENG_ILL_WHICH)
    }

    pub(crate) fn backward_ref(&self, which: usize) -> Result<&EngineMem, i32> {
        self.backwards.get(which).ok_or(ENG_ILL_WHICH)
    }

    pub fn set_user_data_b(&mut self, which: usize, token: UserToken) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => {
                c.set_user_data(token);
                ENG_SUCCESS
            }
            Err(flag) => flag,
        }
    }

    pub fn set_ss_tolerances_b(&mut self, which: usize, rtol: f64, atol: f64) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_ss_tolerances(rtol, atol),
            Err(flag) => flag,
        }
    }

    pub fn set_sv_tolerances_b(&mut self, which: usize, rtol: f64, atol: &[f64]) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_sv_tolerances(rtol, atol),
            Err(flag) => flag,
        }
    }

    pub fn attach_dense_b(&mut self, which: usize) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.attach_dense(),
            Err(flag) => flag,
        }
    }

    pub fn set_dense_jac_fn_b(&mut self, which: usize, jac: Option<DenseJacFnB>) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_dense_jac_dispatch(jac.map(DenseJacDispatch::Bwd)),
            Err(flag) => flag,
        }
    }

    pub fn attach_band_b(&mut self, which: usize, mupper: usize, mlower: usize) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.attach_band(mupper, mlower),
            Err(flag) => flag,
        }
    }

    pub fn set_band_jac_fn_b(&mut self, which: usize, jac: Option<BandJacFnB>) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_band_jac_dispatch(jac.map(BandJacDispatch::Bwd)),
            Err(flag) => flag,
        }
    }

    pub fn attach_diag_b(&mut self, which: usize) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.attach_diag(),
            Err(flag) => flag,
        }
    }

    pub fn attach_krylov_b(&mut self, which: usize, pretype: PrecType, maxl: usize) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.attach_krylov(pretype, maxl),
            Err(flag) => flag,
        }
    }

    pub fn set_preconditioner_b(
        &mut self,
        which: usize,
        setup: Option<PrecSetupFnB>,
        solve: PrecSolveFnB,
    ) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_prec_dispatch(
                setup.map(PrecSetupDispatch::Bwd),
                Some(PrecSolveDispatch::Bwd(solve)),
            ),
            Err(flag) => flag,
        }
    }

    pub fn set_jac_times_vec_fn_b(&mut self, which: usize, jtimes: Option<JacTimesFnB>) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.set_jac_times_dispatch(jtimes.map(JacTimesDispatch::Bwd)),
            Err(flag) => flag,
        }
    }

    /// Integrate every backward problem down to `tbout`.
    ///
    /// Each child is stopped at the start of the recorded forward interval;
    /// the interpolated forward state does not exist beyond it.
    pub fn backward(&mut self, tbout: f64) -> i32 {
        let Some(adj) = &self.adj else {
            return ENG_NO_ADJ;
        };
        if self.backwards.is_empty() {
            return ENG_ILL_INPUT;
        }
        let t_earliest = adj.hist.borrow().earliest_t();
        for child in &mut self.backwards {
            if child.tn == tbout {
                continue;
            }
            if let Some(te) = t_earliest {
                child.tstop = Some(te);
            }
            let mut yout = vec![0.0; child.n];
            let (_, flag) = child.advance(tbout, &mut yout, StepMode::Normal);
            if flag < 0 {
                return flag;
            }
        }
        ENG_SUCCESS
    }

    /// Last output of backward problem `which`: `(t, flag)`, filling `yb`.
    pub fn get_backward(&self, which: usize, yb: &mut [f64]) -> (f64, i32) {
        match self.backward_ref(which) {
            Ok(c) => {
                if yb.len() != c.n {
                    return (0.0, ENG_ILL_INPUT);
                }
                yb.copy_from_slice(&c.yret);
                (c.tret, ENG_SUCCESS)
            }
            Err(flag) => (0.0, flag),
        }
    }

    // ── backward quadrature extension ────────────────────────────

    pub fn quad_init_b(&mut self, which: usize, f: QuadRhsFnB, yq0: &[f64]) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => {
                c.quadb = Some(QuadCtl {
                    f,
                    yq: yq0.to_vec(),
                    qdot: RealBuffer::new(yq0.len()),
                    nqe: 0,
                });
                ENG_SUCCESS
            }
            Err(flag) => flag,
        }
    }

    pub fn get_quad_b(&self, which: usize, yq: &mut [f64]) -> (f64, i32) {
        match self.backward_ref(which) {
            Ok(c) => match &c.quadb {
                Some(q) => {
                    if yq.len() != q.yq.len() {
                        return (0.0, ENG_ILL_INPUT);
                    }
                    yq.copy_from_slice(&q.yq);
                    (c.tn, ENG_SUCCESS)
                }
                None => (0.0, ENG_ILL_INPUT),
            },
            Err(flag) => (0.0, flag),
        }
    }

    pub fn get_num_quad_rhs_evals_b(&self, which: usize) -> Option<u64> {
        self.backward_ref(which).ok()?.quadb.as_ref().map(|q| q.nqe)
    }

    /// Integrator statistics of backward problem `which`.
    #[must_use]
    pub fn get_integrator_stats_b(&self, which: usize) -> Option<crate::mem::IntegratorStats> {
        self.backward_ref(which).ok().map(|c| c.get_integrator_stats())
    }

    #[must_use]
    pub fn num_backward_problems(&self) -> usize {
        self.backwards.len()
    }

    /// Advance the quadrature over the just-accepted step, rectangle rule at
    /// the step's start point.
    pub(crate) fn quad_step(&mut self) -> i32 {
        let Some(mut q) = self.quadb.take() else {
            return ENG_SUCCESS;
        };
        let h = self.tn - self.told;
        let told = self.told;
        let flag = {
            let yb = self.yold.clone();
            q.nqe += 1;
            match self.fwd_ctx.as_ref() {
                Some(ctx) => {
                    if ctx.hist.borrow().interp(told, &ctx.yfwd) {
                        (q.f)(told, &ctx.yfwd, &yb, &q.qdot, self.user_data)
                    } else {
                        CB_UNRECOVERABLE
                    }
                }
                None => CB_UNRECOVERABLE,
            }
        };
        if flag != 0 {
            self.quadb = Some(q);
            return ENG_QRHSFUNC_FAIL;
        }
        let qdot = q.qdot.to_vec();
        for (yqi, qi) in q.yq.iter_mut().zip(qdot.iter()) {
            *yqi += h * qi;
        }
        self.quadb = Some(q);
        ENG_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjoint_history_interp_linear_trajectory() {
        let mut h = History::default();
        // y(t) = 2t over [0, 2], ydot = 2
        h.record(0.0, vec![0.0], vec![2.0]);
        h.record(1.0, vec![2.0], vec![2.0]);
        h.record(2.0, vec![4.0], vec![2.0]);
        let out = RealBuffer::new(1);
        assert!(h.interp(0.5, &out));
        assert!((out.to_vec()[0] - 1.0).abs() < 1e-12);
        assert!(h.interp(1.75, &out));
        assert!((out.to_vec()[0] - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_adjoint_history_interp_out_of_range() {
        let mut h = History::default();
        h.record(0.0, vec![1.0], vec![0.0]);
        h.record(1.0, vec![1.0], vec![0.0]);
        let out = RealBuffer::new(1);
        assert!(!h.interp(5.0, &out));
        assert!(!h.interp(-3.0, &out));
    }

    #[test]
    fn test_adjoint_history_empty_fails() {
        let h = History::default();
        let out = RealBuffer::new(1);
        assert!(!h.interp(0.0, &out));
    }
}
