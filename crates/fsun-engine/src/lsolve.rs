#![forbid(unsafe_code)]

//! Newton linear-solver modules: dense and banded direct factorization,
//! diagonal approximation, and a restarted GMRES Krylov iteration with
//! optional user or band-block-diagonal preconditioning.
//!
//! Exactly one module is installed per problem; attaching a new one
//! replaces the old wholesale, including any preconditioner state.

use fsun_nvec::RealBuffer;
use fsun_runtime::UNIT_ROUNDOFF;
use nalgebra::{DVector, Dyn, LU};

use crate::bbd::BbdData;
use crate::flags::*;
use crate::matrix::{BandMatrix, DenseMatrix};
use crate::mem::{EngineMem, IterKind};
use crate::stepper::CorrFail;
use crate::types::{
    BandJacFn, BandJacFnB, DenseJacFn, DenseJacFnB, JacTimesFn, JacTimesFnB, PrecSetupFn,
    PrecSetupFnB, PrecSolveFn, PrecSolveFnB, PrecType,
};

// Re-factor the iteration matrix after this many steps even if nothing else
// forces it, and whenever gamma drifts by more than DGMAX.
const MSBP: u64 = 20;
const DGMAX: f64 = 0.3;
const SPILS_MAXL_DEFAULT: usize = 5;
const SPILS_EPS_LIN_DEFAULT: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub(crate) enum DenseJacDispatch {
    Fwd(DenseJacFn),
    Bwd(DenseJacFnB),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum BandJacDispatch {
    Fwd(BandJacFn),
    Bwd(BandJacFnB),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PrecSetupDispatch {
    Fwd(PrecSetupFn),
    Bwd(PrecSetupFnB),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PrecSolveDispatch {
    Fwd(PrecSolveFn),
    Bwd(PrecSolveFnB),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum JacTimesDispatch {
    Fwd(JacTimesFn),
    Bwd(JacTimesFnB),
}

#[derive(Debug)]
pub(crate) struct DenseData {
    pub(crate) jac: Option<DenseJacDispatch>,
    pub(crate) jmat: DenseMatrix,
    pub(crate) lu: Option<LU<f64, Dyn, Dyn>>,
    pub(crate) gamma_saved: f64,
    pub(crate) nstlj: u64,
    pub(crate) njev: u64,
    pub(crate) nfe_dq: u64,
}

impl DenseData {
    fn new(n: usize) -> Self {
        Self {
            jac: None,
            jmat: DenseMatrix::new(n, n),
            lu: None,
            gamma_saved: 0.0,
            nstlj: 0,
            njev: 0,
            nfe_dq: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BandData {
    pub(crate) mupper: usize,
    pub(crate) mlower: usize,
    pub(crate) jac: Option<BandJacDispatch>,
    pub(crate) jmat: BandMatrix,
    pub(crate) mmat: BandMatrix,
    pub(crate) factored: bool,
    pub(crate) gamma_saved: f64,
    pub(crate) nstlj: u64,
    pub(crate) njev: u64,
    pub(crate) nfe_dq: u64,
}

impl BandData {
    fn new(n: usize, mupper: usize, mlower: usize) -> Self {
        Self {
            mupper,
            mlower,
            jac: None,
            jmat: BandMatrix::new(n, mupper, mlower),
            mmat: BandMatrix::new(n, mupper, mlower),
            factored: false,
            gamma_saved: 0.0,
            nstlj: 0,
            njev: 0,
            nfe_dq: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DiagData {
    pub(crate) mdiag: Vec<f64>,
    pub(crate) built: bool,
    pub(crate) gamma_saved: f64,
    pub(crate) nstlj: u64,
    pub(crate) nfe_di: u64,
}

#[derive(Debug)]
pub(crate) struct SpilsData {
    pub(crate) pretype: PrecType,
    pub(crate) maxl: usize,
    pub(crate) eps_lin: f64,
    pub(crate) psetup: Option<PrecSetupDispatch>,
    pub(crate) psolve: Option<PrecSolveDispatch>,
    pub(crate) jtimes: Option<JacTimesDispatch>,
    pub(crate) gamma_saved: f64,
    pub(crate) nstlj: u64,
    pub(crate) npe: u64,
    pub(crate) nps: u64,
    pub(crate) nli: u64,
    pub(crate) ncfl: u64,
    pub(crate) njtv: u64,
    pub(crate) nfe_sg: u64,
    pub(crate) bbd: Option<BbdData>,
}

/// The installed linear-solver module. `None` means functional iteration.
#[derive(Debug, Default)]
pub(crate) enum LinMod {
    #[default]
    None,
    Dense(DenseData),
    Band(BandData),
    Diag(DiagData),
    Spils(SpilsData),
}

fn gamma_drifted(gamma: f64, saved: f64) -> bool {
    if saved == 0.0 {
        return true;
    }
    (gamma / saved - 1.0).abs() > DGMAX
}

impl LinMod {
    pub(crate) fn needs_setup(&self, nst: u64, gamma: f64) -> bool {
        match self {
            LinMod::None => false,
            LinMod::Dense(d) => {
                d.lu.is_none() || nst >= d.nstlj + MSBP || gamma_drifted(gamma, d.gamma_saved)
            }
            LinMod::Band(b) => {
                !b.factored || nst >= b.nstlj + MSBP || gamma_drifted(gamma, b.gamma_saved)
            }
            LinMod::Diag(d) => {
                !d.built || nst >= d.nstlj + MSBP || gamma_drifted(gamma, d.gamma_saved)
            }
            LinMod::Spils(s) => {
                if s.psetup.is_none() && s.bbd.is_none() {
                    false
                } else {
                    s.nstlj == 0 && s.gamma_saved == 0.0
                        || nst >= s.nstlj + MSBP
                        || gamma_drifted(gamma, s.gamma_saved)
                }
            }
        }
    }
}

impl EngineMem {
    // ── attachment ───────────────────────────────────────────────

    pub fn attach_dense(&mut self) -> i32 {
        if !self.initialized {
            return ENG_MEM_NULL;
        }
        self.iter = IterKind::Newton;
        self.lin = LinMod::Dense(DenseData::new(self.n));
        ENG_SUCCESS
    }

    pub fn attach_band(&mut self, mupper: usize, mlower: usize) -> i32 {
        if !self.initialized {
            return ENG_MEM_NULL;
        }
        if mupper >= self.n.max(1) || mlower >= self.n.max(1) {
            return ENG_ILL_INPUT;
        }
        self.iter = IterKind::Newton;
        self.lin = LinMod::Band(BandData::new(self.n, mupper, mlower));
        ENG_SUCCESS
    }

    pub fn attach_diag(&mut self) -> i32 {
        if !self.initialized {
            return ENG_MEM_NULL;
        }
        self.iter = IterKind::Newton;
        self.lin = LinMod::Diag(DiagData {
            mdiag: vec![0.0; self.n],
            built: false,
            gamma_saved: 0.0,
            nstlj: 0,
            nfe_di: 0,
        });
        ENG_SUCCESS
    }

    pub fn attach_krylov(&mut self, pretype: PrecType, maxl: usize) -> i32 {
        if !self.initialized {
            return ENG_MEM_NULL;
        }
        self.iter = IterKind::Newton;
        self.lin = LinMod::Spils(SpilsData {
            pretype,
            maxl: if maxl == 0 { SPILS_MAXL_DEFAULT } else { maxl },
            eps_lin: SPILS_EPS_LIN_DEFAULT,
            psetup: None,
            psolve: None,
            jtimes: None,
            gamma_saved: 0.0,
            nstlj: 0,
            npe: 0,
            nps: 0,
            nli: 0,
            ncfl: 0,
            njtv: 0,
            nfe_sg: 0,
            bbd: None,
        });
        ENG_SUCCESS
    }

    // ── callback registration on the active module ───────────────

    pub(crate) fn set_dense_jac_dispatch(&mut self, jac: Option<DenseJacDispatch>) -> i32 {
        match &mut self.lin {
            LinMod::Dense(d) => {
                d.jac = jac;
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_dense_jac_fn(&mut self, jac: Option<DenseJacFn>) -> i32 {
        self.set_dense_jac_dispatch(jac.map(DenseJacDispatch::Fwd))
    }

    pub(crate) fn set_band_jac_dispatch(&mut self, jac: Option<BandJacDispatch>) -> i32 {
        match &mut self.lin {
            LinMod::Band(b) => {
                b.jac = jac;
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_band_jac_fn(&mut self, jac: Option<BandJacFn>) -> i32 {
        self.set_band_jac_dispatch(jac.map(BandJacDispatch::Fwd))
    }

    pub(crate) fn set_prec_dispatch(
        &mut self,
        setup: Option<PrecSetupDispatch>,
        solve: Option<PrecSolveDispatch>,
    ) -> i32 {
        match &mut self.lin {
            LinMod::Spils(s) => {
                s.psetup = setup;
                s.psolve = solve;
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_preconditioner(&mut self, setup: Option<PrecSetupFn>, solve: PrecSolveFn) -> i32 {
        self.set_prec_dispatch(
            setup.map(PrecSetupDispatch::Fwd),
            Some(PrecSolveDispatch::Fwd(solve)),
        )
    }

    pub(crate) fn set_jac_times_dispatch(&mut self, jtimes: Option<JacTimesDispatch>) -> i32 {
        match &mut self.lin {
            LinMod::Spils(s) => {
                s.jtimes = jtimes;
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_jac_times_vec_fn(&mut self, jtimes: Option<JacTimesFn>) -> i32 {
        self.set_jac_times_dispatch(jtimes.map(JacTimesDispatch::Fwd))
    }

    pub fn set_prec_type(&mut self, pretype: PrecType) -> i32 {
        match &mut self.lin {
            LinMod::Spils(s) => {
                s.pretype = pretype;
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_eps_lin(&mut self, eplifac: f64) -> i32 {
        match &mut self.lin {
            LinMod::Spils(s) => {
                if eplifac < 0.0 {
                    return ENG_ILL_INPUT;
                }
                s.eps_lin = if eplifac == 0.0 {
                    SPILS_EPS_LIN_DEFAULT
                } else {
                    eplifac
                };
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    pub fn set_maxl(&mut self, maxl: usize) -> i32 {
        match &mut self.lin {
            LinMod::Spils(s) => {
                s.maxl = if maxl == 0 { SPILS_MAXL_DEFAULT } else { maxl };
                ENG_SUCCESS
            }
            _ => ENG_ILL_INPUT,
        }
    }

    // ── setup / solve, called from the Newton iteration ──────────

    pub(crate) fn lsetup(&mut self, t: f64, gamma: f64, jok: bool) -> i32 {
        let mut lin = std::mem::take(&mut self.lin);
        let flag = match &mut lin {
            LinMod::None => 0,
            LinMod::Dense(d) => self.dense_setup(d, t, gamma, jok),
            LinMod::Band(b) => self.band_setup(b, t, gamma, jok),
            LinMod::Diag(d) => self.diag_setup(d, t, gamma),
            LinMod::Spils(s) => self.spils_setup(s, t, gamma, jok),
        };
        self.lin = lin;
        flag
    }

    pub(crate) fn lsolve(
        &mut self,
        t: f64,
        gamma: f64,
        res: &[f64],
    ) -> Result<Vec<f64>, CorrFail> {
        let mut lin = std::mem::take(&mut self.lin);
        let out = match &mut lin {
            LinMod::None => Err(CorrFail::LsolveFail),
            LinMod::Dense(d) => match &d.lu {
                Some(lu) => {
                    let b = DVector::from_column_slice(res);
                    match lu.solve(&b) {
                        Some(x) => Ok(x.as_slice().to_vec()),
                        None => Err(CorrFail::LsolveRecoverable),
                    }
                }
                None => Err(CorrFail::LsolveFail),
            },
            LinMod::Band(bd) => {
                if bd.factored {
                    let mut x = res.to_vec();
                    bd.mmat.backsolve(&mut x);
                    Ok(x)
                } else {
                    Err(CorrFail::LsolveFail)
                }
            }
            LinMod::Diag(dg) => {
                if dg.built {
                    Ok(res
                        .iter()
                        .enumerate()
                        .map(|(i, r)| r / dg.mdiag[i])
                        .collect())
                } else {
                    Err(CorrFail::LsolveFail)
                }
            }
            LinMod::Spils(s) => self.gmres_solve(s, t, gamma, res),
        };
        self.lin = lin;
        out
    }

    // ── dense module ─────────────────────────────────────────────

    fn call_dense_jac(&mut self, disp: DenseJacDispatch, t: f64, jm: &DenseMatrix) -> i32 {
        let flag = match disp {
            DenseJacDispatch::Fwd(f) => f(
                t,
                &self.xcor,
                &self.fnew,
                jm,
                (&self.tmp1, &self.tmp2, &self.tmp3),
                self.user_data,
            ),
            DenseJacDispatch::Bwd(f) => {
                let Some(yfwd) = self.bwd_yfwd(t) else {
                    return CB_UNRECOVERABLE;
                };
                f(
                    t,
                    &yfwd,
                    &self.xcor,
                    &self.fnew,
                    jm,
                    (&self.tmp1, &self.tmp2, &self.tmp3),
                    self.user_data,
                )
            }
        };
        jm.relinquish();
        flag
    }

    fn dense_setup(&mut self, d: &mut DenseData, t: f64, gamma: f64, jok: bool) -> i32 {
        let refresh = !jok || d.lu.is_none() || self.nst >= d.nstlj + MSBP;
        if refresh {
            d.jmat.set_to_zero();
            let flag = match d.jac {
                Some(disp) => {
                    d.njev += 1;
                    let jm = d.jmat.clone();
                    self.call_dense_jac(disp, t, &jm)
                }
                None => self.dense_fd_jac(d, t),
            };
            if flag != 0 {
                return flag;
            }
            d.nstlj = self.nst;
        }
        let n = self.n;
        let mut m = d.jmat.to_dmatrix() * (-gamma);
        for i in 0..n {
            m[(i, i)] += 1.0;
        }
        d.lu = Some(LU::new(m));
        d.gamma_saved = gamma;
        ENG_SUCCESS
    }

    fn dense_fd_jac(&mut self, d: &mut DenseData, t: f64) -> i32 {
        let n = self.n;
        let srur = UNIT_ROUNDOFF.sqrt();
        let y0 = self.xcor.to_vec();
        let f0 = self.fnew.to_vec();
        let ewt = self.ewt.to_vec();
        let ybuf = self.tmp1.clone();
        let fbuf = self.tmp2.clone();
        for j in 0..n {
            let sig = srur * y0[j].abs().max(0.001 / ewt[j]);
            let mut yp = y0.clone();
            yp[j] += sig;
            ybuf.copy_from_slice(&yp);
            let flag = self.eval_rhs_counted(t, &ybuf, &fbuf, false);
            d.nfe_dq += 1;
            if flag != 0 {
                return flag;
            }
            let fv = fbuf.to_vec();
            let col: Vec<f64> = fv.iter().zip(f0.iter()).map(|(a, b)| (a - b) / sig).collect();
            d.jmat.set_column(j, &col);
        }
        0
    }

    // ── band module ──────────────────────────────────────────────

    fn call_band_jac(&mut self, disp: BandJacDispatch, t: f64, b: &BandData) -> i32 {
        let jm = b.jmat.clone();
        let flag = match disp {
            BandJacDispatch::Fwd(f) => f(
                b.mupper,
                b.mlower,
                t,
                &self.xcor,
                &self.fnew,
                &jm,
                (&self.tmp1, &self.tmp2, &self.tmp3),
                self.user_data,
            ),
            BandJacDispatch::Bwd(f) => {
                let Some(yfwd) = self.bwd_yfwd(t) else {
                    return CB_UNRECOVERABLE;
                };
                f(
                    b.mupper,
                    b.mlower,
                    t,
                    &yfwd,
                    &self.xcor,
                    &self.fnew,
                    &jm,
                    (&self.tmp1, &self.tmp2, &self.tmp3),
                    self.user_data,
                )
            }
        };
        jm.relinquish();
        flag
    }

    fn band_setup(&mut self, b: &mut BandData, t: f64, gamma: f64, jok: bool) -> i32 {
        let refresh = !jok || !b.factored || self.nst >= b.nstlj + MSBP;
        if refresh {
            b.jmat.set_to_zero();
            let flag = match b.jac {
                Some(disp) => {
                    b.njev += 1;
                    self.call_band_jac(disp, t, b)
                }
                None => self.band_fd_jac(b, t),
            };
            if flag != 0 {
                return flag;
            }
            b.nstlj = self.nst;
        }
        // M = I - gamma*J over the stored band
        let n = self.n;
        b.mmat.set_to_zero();
        for j in 0..n {
            let lo = j.saturating_sub(b.mupper);
            let hi = (j + b.mlower).min(n - 1);
            for i in lo..=hi {
                let idm = if i == j { 1.0 } else { 0.0 };
                b.mmat.set(i, j, idm - gamma * b.jmat.get(i, j));
            }
        }
        if !b.mmat.factor() {
            b.factored = false;
            return 1;
        }
        b.factored = true;
        b.gamma_saved = gamma;
        ENG_SUCCESS
    }

    fn band_fd_jac(&mut self, b: &mut BandData, t: f64) -> i32 {
        let n = self.n;
        let srur = UNIT_ROUNDOFF.sqrt();
        let y0 = self.xcor.to_vec();
        let f0 = self.fnew.to_vec();
        let ewt = self.ewt.to_vec();
        let width = b.mupper + b.mlower + 1;
        let ybuf = self.tmp1.clone();
        let fbuf = self.tmp2.clone();
        for group in 0..width.min(n.max(1)) {
            let mut yp = y0.clone();
            for j in (group..n).step_by(width) {
                let sig = srur * y0[j].abs().max(0.001 / ewt[j]);
                yp[j] += sig;
            }
            ybuf.copy_from_slice(&yp);
            let flag = self.eval_rhs_counted(t, &ybuf, &fbuf, false);
            b.nfe_dq += 1;
            if flag != 0 {
                return flag;
            }
            let fv = fbuf.to_vec();
            for j in (group..n).step_by(width) {
                let sig = srur * y0[j].abs().max(0.001 / ewt[j]);
                let lo = j.saturating_sub(b.mupper);
                let hi = (j + b.mlower).min(n - 1);
                for i in lo..=hi {
                    b.jmat.set(i, j, (fv[i] - f0[i]) / sig);
                }
            }
        }
        0
    }

    // ── diagonal module ──────────────────────────────────────────

    fn diag_setup(&mut self, d: &mut DiagData, t: f64, gamma: f64) -> i32 {
        let n = self.n;
        let srur = UNIT_ROUNDOFF.sqrt();
        let y0 = self.xcor.to_vec();
        let f0 = self.fnew.to_vec();
        let ewt = self.ewt.to_vec();
        let sigs: Vec<f64> = (0..n)
            .map(|i| srur * y0[i].abs().max(0.001 / ewt[i]))
            .collect();
        let yp: Vec<f64> = y0.iter().zip(sigs.iter()).map(|(y, s)| y + s).collect();
        let ybuf = self.tmp1.clone();
        let fbuf = self.tmp2.clone();
        ybuf.copy_from_slice(&yp);
        let flag = self.eval_rhs_counted(t, &ybuf, &fbuf, false);
        d.nfe_di += 1;
        if flag != 0 {
            return flag;
        }
        let fv = fbuf.to_vec();
        for i in 0..n {
            let jii = (fv[i] - f0[i]) / sigs[i];
            let m = 1.0 - gamma * jii;
            if m == 0.0 || !m.is_finite() {
                d.built = false;
                return 1;
            }
            d.mdiag[i] = m;
        }
        d.built = true;
        d.gamma_saved = gamma;
        d.nstlj = self.nst;
        ENG_SUCCESS
    }

    // ── Krylov module ────────────────────────────────────────────

    pub(crate) fn bwd_yfwd(&self, t: f64) -> Option<RealBuffer> {
        let ctx = self.fwd_ctx.as_ref()?;
        if !ctx.hist.borrow().interp(t, &ctx.yfwd) {
            return None;
        }
        Some(ctx.yfwd.clone())
    }

    fn spils_setup(&mut self, s: &mut SpilsData, t: f64, gamma: f64, jok: bool) -> i32 {
        if s.bbd.is_some() {
            let mut bbd = s.bbd.take().expect("bbd checked above");
            s.npe += 1;
            let flag = self.bbd_setup(&mut bbd, t, gamma, jok);
            s.bbd = Some(bbd);
            if flag == 0 {
                s.gamma_saved = gamma;
                s.nstlj = self.nst;
            }
            return flag;
        }
        if let Some(disp) = s.psetup {
            s.npe += 1;
            let mut jcur = false;
            let flag = match disp {
                PrecSetupDispatch::Fwd(f) => f(
                    t,
                    &self.xcor,
                    &self.fnew,
                    jok,
                    &mut jcur,
                    gamma,
                    (&self.tmp1, &self.tmp2, &self.tmp3),
                    self.user_data,
                ),
                PrecSetupDispatch::Bwd(f) => {
                    let Some(yfwd) = self.bwd_yfwd(t) else {
                        return CB_UNRECOVERABLE;
                    };
                    f(
                        t,
                        &yfwd,
                        &self.xcor,
                        &self.fnew,
                        jok,
                        &mut jcur,
                        gamma,
                        (&self.tmp1, &self.tmp2, &self.tmp3),
                        self.user_data,
                    )
                }
            };
            if flag == 0 {
                s.gamma_saved = gamma;
                s.nstlj = self.nst;
            }
            return flag;
        }
        ENG_SUCCESS
    }

    fn spils_jtimes(
        &mut self,
        s: &mut SpilsData,
        t: f64,
        v: &[f64],
    ) -> Result<Vec<f64>, CorrFail> {
        if let Some(disp) = s.jtimes {
            s.njtv += 1;
            let vbuf = self.tmp1.clone();
            vbuf.copy_from_slice(v);
            let jvbuf = self.tmp2.clone();
            jvbuf.fill(0.0);
            let flag = match disp {
                JacTimesDispatch::Fwd(f) => f(
                    &vbuf,
                    &jvbuf,
                    t,
                    &self.xcor,
                    &self.fnew,
                    &self.tmp3,
                    self.user_data,
                ),
                JacTimesDispatch::Bwd(f) => {
                    let Some(yfwd) = self.bwd_yfwd(t) else {
                        return Err(CorrFail::LsolveFail);
                    };
                    f(
                        &vbuf,
                        &jvbuf,
                        t,
                        &yfwd,
                        &self.xcor,
                        &self.fnew,
                        &self.tmp3,
                        self.user_data,
                    )
                }
            };
            if flag > 0 {
                return Err(CorrFail::LsolveRecoverable);
            }
            if flag < 0 {
                return Err(CorrFail::LsolveFail);
            }
            return Ok(jvbuf.to_vec());
        }
        // difference quotient around the current Newton iterate
        let vn = self.wrms_slice(v);
        if vn == 0.0 {
            return Ok(vec![0.0; self.n]);
        }
        let sig = 1.0 / vn;
        let x = self.xcor.to_vec();
        let f0 = self.fnew.to_vec();
        let yp: Vec<f64> = x.iter().zip(v.iter()).map(|(xi, vi)| xi + sig * vi).collect();
        let ybuf = self.tmp1.clone();
        let fbuf = self.tmp2.clone();
        ybuf.copy_from_slice(&yp);
        let flag = self.eval_rhs_counted(t, &ybuf, &fbuf, false);
        s.nfe_sg += 1;
        if flag > 0 {
            return Err(CorrFail::LsolveRecoverable);
        }
        if flag < 0 {
            return Err(CorrFail::LsolveFail);
        }
        let fv = fbuf.to_vec();
        Ok(fv.iter().zip(f0.iter()).map(|(a, b)| (a - b) / sig).collect())
    }

    fn spils_psolve(
        &mut self,
        s: &mut SpilsData,
        t: f64,
        gamma: f64,
        delta: f64,
        r: &[f64],
    ) -> Result<Vec<f64>, CorrFail> {
        if let Some(bbd) = &mut s.bbd {
            if !bbd.factored {
                return Err(CorrFail::LsolveFail);
            }
            s.nps += 1;
            let mut z = r.to_vec();
            bbd.pmat.backsolve(&mut z);
            return Ok(z);
        }
        let Some(disp) = s.psolve else {
            return Ok(r.to_vec());
        };
        s.nps += 1;
        let rbuf = self.tmp1.clone();
        rbuf.copy_from_slice(r);
        let zbuf = self.tmp2.clone();
        zbuf.fill(0.0);
        let left = matches!(s.pretype, PrecType::Left | PrecType::Both);
        let flag = match disp {
            PrecSolveDispatch::Fwd(f) => f(
                t,
                &self.xcor,
                &self.fnew,
                &rbuf,
                &zbuf,
                gamma,
                delta,
                left,
                &self.tmp3,
                self.user_data,
            ),
            PrecSolveDispatch::Bwd(f) => {
                let Some(yfwd) = self.bwd_yfwd(t) else {
                    return Err(CorrFail::LsolveFail);
                };
                f(
                    t,
                    &yfwd,
                    &self.xcor,
                    &self.fnew,
                    &rbuf,
                    &zbuf,
                    gamma,
                    delta,
                    left,
                    &self.tmp3,
                    self.user_data,
                )
            }
        };
        if flag > 0 {
            return Err(CorrFail::LsolveRecoverable);
        }
        if flag < 0 {
            return Err(CorrFail::LsolveFail);
        }
        Ok(zbuf.to_vec())
    }

    /// Restarted GMRES with modified Gram-Schmidt, preconditioned on the
    /// left when a preconditioner is configured.
    fn gmres_solve(
        &mut self,
        s: &mut SpilsData,
        t: f64,
        gamma: f64,
        b: &[f64],
    ) -> Result<Vec<f64>, CorrFail> {
        let n = self.n;
        if n == 0 {
            return Ok(Vec::new());
        }
        let maxl = s.maxl.min(n.max(1));
        let use_prec =
            !matches!(s.pretype, PrecType::None) && (s.psolve.is_some() || s.bbd.is_some());

        let norm2 = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        let delta = s.eps_lin * norm2(b).max(f64::MIN_POSITIVE);

        let r0 = if use_prec {
            self.spils_psolve(s, t, gamma, delta, b)?
        } else {
            b.to_vec()
        };
        let beta = norm2(&r0);
        if beta == 0.0 {
            return Ok(vec![0.0; n]);
        }
        let tol = s.eps_lin * beta;

        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(maxl + 1);
        basis.push(r0.iter().map(|x| x / beta).collect());
        let mut hess = vec![vec![0.0f64; maxl]; maxl + 1];
        let mut cs = vec![0.0f64; maxl];
        let mut sn = vec![0.0f64; maxl];
        let mut g = vec![0.0f64; maxl + 1];
        g[0] = beta;

        let mut iters = 0usize;
        let mut resnorm = beta;
        for j in 0..maxl {
            iters = j + 1;
            let jv = self.spils_jtimes(s, t, &basis[j])?;
            let av: Vec<f64> = basis[j]
                .iter()
                .zip(jv.iter())
                .map(|(vi, jvi)| vi - gamma * jvi)
                .collect();
            let mut w = if use_prec {
                self.spils_psolve(s, t, gamma, delta, &av)?
            } else {
                av
            };
            for (i, vi) in basis.iter().enumerate().take(j + 1) {
                let hij: f64 = w.iter().zip(vi.iter()).map(|(a, b)| a * b).sum();
                hess[i][j] = hij;
                for (wk, vk) in w.iter_mut().zip(vi.iter()) {
                    *wk -= hij * vk;
                }
            }
            let hnext = norm2(&w);
            hess[j + 1][j] = hnext;
            for i in 0..j {
                let tmp = cs[i] * hess[i][j] + sn[i] * hess[i + 1][j];
                hess[i + 1][j] = -sn[i] * hess[i][j] + cs[i] * hess[i + 1][j];
                hess[i][j] = tmp;
            }
            let r = hess[j][j].hypot(hess[j + 1][j]);
            if r == 0.0 {
                break;
            }
            cs[j] = hess[j][j] / r;
            sn[j] = hess[j + 1][j] / r;
            hess[j][j] = r;
            hess[j + 1][j] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];
            resnorm = g[j + 1].abs();
            if resnorm <= tol || hnext == 0.0 {
                break;
            }
            basis.push(w.iter().map(|x| x / hnext).collect());
        }
        s.nli += iters as u64;

        let mut coef = vec![0.0f64; iters];
        for i in (0..iters).rev() {
            let mut sum = g[i];
            for (k, ck) in coef.iter().enumerate().take(iters).skip(i + 1) {
                sum -= hess[i][k] * ck;
            }
            if hess[i][i] == 0.0 {
                s.ncfl += 1;
                return Err(CorrFail::LsolveRecoverable);
            }
            coef[i] = sum / hess[i][i];
        }
        let mut x = vec![0.0f64; n];
        for (k, vk) in basis.iter().take(iters).enumerate() {
            for (xi, vki) in x.iter_mut().zip(vk.iter()) {
                *xi += coef[k] * vki;
            }
        }
        // accept any genuine residual reduction; a stagnant iteration is a
        // recoverable failure that shrinks the step
        if resnorm > tol && resnorm >= beta {
            s.ncfl += 1;
            return Err(CorrFail::LsolveRecoverable);
        }
        Ok(x)
    }

    // ── per-module statistics ────────────────────────────────────

    #[must_use]
    pub fn dls_get_num_jac_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Dense(d) => Some(d.njev),
            LinMod::Band(b) => Some(b.njev),
            _ => None,
        }
    }

    #[must_use]
    pub fn dls_get_num_rhs_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Dense(d) => Some(d.nfe_dq),
            LinMod::Band(b) => Some(b.nfe_dq),
            _ => None,
        }
    }

    #[must_use]
    pub fn dls_get_work_space(&self) -> Option<(usize, usize)> {
        match &self.lin {
            LinMod::Dense(_) => Some((2 * self.n * self.n + self.n, self.n)),
            LinMod::Band(b) => Some((
                self.n * (2 * (b.mupper + b.mlower + 1)) + self.n,
                self.n,
            )),
            _ => None,
        }
    }

    #[must_use]
    pub fn diag_get_work_space(&self) -> Option<(usize, usize)> {
        match &self.lin {
            LinMod::Diag(_) => Some((3 * self.n, 0)),
            _ => None,
        }
    }

    #[must_use]
    pub fn diag_get_num_rhs_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Diag(d) => Some(d.nfe_di),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_lin_iters(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.nli),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_conv_fails(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.ncfl),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_prec_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.npe),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_prec_solves(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.nps),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_jtimes_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.njtv),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_num_rhs_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => Some(s.nfe_sg),
            _ => None,
        }
    }

    #[must_use]
    pub fn spils_get_work_space(&self) -> Option<(usize, usize)> {
        match &self.lin {
            LinMod::Spils(s) => Some(((s.maxl + 5) * self.n + s.maxl * (s.maxl + 4), 10)),
            _ => None,
        }
    }
}
