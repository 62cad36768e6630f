#![forbid(unsafe_code)]

//! Band-block-diagonal preconditioner.
//!
//! Approximates the local coupling of the problem by difference quotients of
//! a user-supplied local function `gloc`, retaining only a band of the
//! result, and uses the banded LU of `I - gamma * J_local` as the
//! preconditioner. An optional communication function runs before `gloc` to
//! let a distributed embedding exchange whatever data `gloc` needs.
//! Backward problems carry the same construction with the interpolated
//! forward state as an extra callback argument.

use fsun_nvec::RealBuffer;
use fsun_runtime::UNIT_ROUNDOFF;

use crate::BandBlockBandwidths;
use crate::flags::*;
use crate::lsolve::LinMod;
use crate::matrix::BandMatrix;
use crate::mem::EngineMem;
use crate::types::{BbdCommFn, BbdCommFnB, BbdLocalFn, BbdLocalFnB};

#[derive(Debug, Clone, Copy)]
pub(crate) enum BbdLocalDispatch {
    Fwd(BbdLocalFn),
    Bwd(BbdLocalFnB),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum BbdCommDispatch {
    Fwd(BbdCommFn),
    Bwd(BbdCommFnB),
}

#[derive(Debug)]
pub(crate) struct BbdData {
    pub(crate) nlocal: usize,
    pub(crate) mudq: usize,
    pub(crate) mldq: usize,
    pub(crate) mukeep: usize,
    pub(crate) mlkeep: usize,
    pub(crate) dqrely: f64,
    pub(crate) local_fn: BbdLocalDispatch,
    pub(crate) comm_fn: Option<BbdCommDispatch>,
    pub(crate) jmat: BandMatrix,
    pub(crate) pmat: BandMatrix,
    pub(crate) have_j: bool,
    pub(crate) factored: bool,
    pub(crate) nge: u64,
    pub(crate) ybuf: RealBuffer,
    pub(crate) gref: RealBuffer,
    pub(crate) gtmp: RealBuffer,
}

fn make_bbd_data(
    n: usize,
    nlocal: usize,
    bw: BandBlockBandwidths,
    dqrely: f64,
    local_fn: BbdLocalDispatch,
    comm_fn: Option<BbdCommDispatch>,
) -> BbdData {
    let mukeep = bw.mukeep.min(n.saturating_sub(1));
    let mlkeep = bw.mlkeep.min(n.saturating_sub(1));
    BbdData {
        nlocal,
        mudq: bw.mudq,
        mldq: bw.mldq,
        mukeep,
        mlkeep,
        dqrely: if dqrely > 0.0 {
            dqrely
        } else {
            UNIT_ROUNDOFF.sqrt()
        },
        local_fn,
        comm_fn,
        jmat: BandMatrix::new(n, mukeep, mlkeep),
        pmat: BandMatrix::new(n, mukeep, mlkeep),
        have_j: false,
        factored: false,
        nge: 0,
        ybuf: RealBuffer::new(n),
        gref: RealBuffer::new(n),
        gtmp: RealBuffer::new(n),
    }
}

impl EngineMem {
    pub(crate) fn install_bbd(
        &mut self,
        nlocal: usize,
        bw: BandBlockBandwidths,
        dqrely: f64,
        local_fn: BbdLocalDispatch,
        comm_fn: Option<BbdCommDispatch>,
    ) -> i32 {
        let n = self.n;
        if nlocal != n || bw.mudq >= n.max(1) || bw.mldq >= n.max(1) {
            return ENG_ILL_INPUT;
        }
        let LinMod::Spils(s) = &mut self.lin else {
            return ENG_ILL_INPUT;
        };
        s.psetup = None;
        s.psolve = None;
        s.bbd = Some(make_bbd_data(n, nlocal, bw, dqrely, local_fn, comm_fn));
        ENG_SUCCESS
    }

    /// Install the band-block-diagonal preconditioner on an attached Krylov
    /// module. Replaces any user preconditioner callbacks.
    pub fn bbd_prec_init(
        &mut self,
        nlocal: usize,
        bw: BandBlockBandwidths,
        dqrely: f64,
        gloc: BbdLocalFn,
        cfn: Option<BbdCommFn>,
    ) -> i32 {
        self.install_bbd(
            nlocal,
            bw,
            dqrely,
            BbdLocalDispatch::Fwd(gloc),
            cfn.map(BbdCommDispatch::Fwd),
        )
    }

    /// Backward-problem variant of [`EngineMem::bbd_prec_init`].
    pub fn bbd_prec_init_b(
        &mut self,
        which: usize,
        nlocal: usize,
        bw: BandBlockBandwidths,
        dqrely: f64,
        gloc: BbdLocalFnB,
        cfn: Option<BbdCommFnB>,
    ) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.install_bbd(
                nlocal,
                bw,
                dqrely,
                BbdLocalDispatch::Bwd(gloc),
                cfn.map(BbdCommDispatch::Bwd),
            ),
            Err(flag) => flag,
        }
    }

    /// Adjust the difference-quotient bandwidths and relative increment of
    /// an installed band-block-diagonal preconditioner.
    pub fn bbd_prec_reinit(&mut self, mudq: usize, mldq: usize, dqrely: f64) -> i32 {
        let n = self.n;
        let LinMod::Spils(s) = &mut self.lin else {
            return ENG_ILL_INPUT;
        };
        let Some(b) = &mut s.bbd else {
            return ENG_ILL_INPUT;
        };
        if mudq >= n.max(1) || mldq >= n.max(1) {
            return ENG_ILL_INPUT;
        }
        b.mudq = mudq;
        b.mldq = mldq;
        b.dqrely = if dqrely > 0.0 {
            dqrely
        } else {
            UNIT_ROUNDOFF.sqrt()
        };
        b.have_j = false;
        ENG_SUCCESS
    }

    pub fn bbd_prec_reinit_b(&mut self, which: usize, mudq: usize, mldq: usize, dqrely: f64) -> i32 {
        match self.backward_mut(which) {
            Ok(c) => c.bbd_prec_reinit(mudq, mldq, dqrely),
            Err(flag) => flag,
        }
    }

    fn call_bbd_comm(&self, b: &BbdData, disp: BbdCommDispatch, t: f64) -> i32 {
        match disp {
            BbdCommDispatch::Fwd(f) => f(b.nlocal, t, &self.xcor, self.user_data),
            BbdCommDispatch::Bwd(f) => {
                let Some(yfwd) = self.bwd_yfwd(t) else {
                    return CB_UNRECOVERABLE;
                };
                f(b.nlocal, t, &yfwd, &self.xcor, self.user_data)
            }
        }
    }

    fn call_bbd_local(&mut self, b: &mut BbdData, t: f64, y: &RealBuffer, g: &RealBuffer) -> i32 {
        b.nge += 1;
        match b.local_fn {
            BbdLocalDispatch::Fwd(f) => f(b.nlocal, t, y, g, self.user_data),
            BbdLocalDispatch::Bwd(f) => {
                let Some(yfwd) = self.bwd_yfwd(t) else {
                    return CB_UNRECOVERABLE;
                };
                f(b.nlocal, t, &yfwd, y, g, self.user_data)
            }
        }
    }

    pub(crate) fn bbd_setup(&mut self, b: &mut BbdData, t: f64, gamma: f64, jok: bool) -> i32 {
        if !jok || !b.have_j {
            if let Some(disp) = b.comm_fn {
                let flag = self.call_bbd_comm(b, disp, t);
                if flag != 0 {
                    return flag;
                }
            }
            let xcur = self.xcor.clone();
            let gref = b.gref.clone();
            let flag = self.call_bbd_local(b, t, &xcur, &gref);
            if flag != 0 {
                return flag;
            }
            let g0 = b.gref.to_vec();
            let y0 = self.xcor.to_vec();
            let ewt = self.ewt.to_vec();
            let n = self.n;
            let width = (b.mudq + b.mldq + 1).min(n.max(1));
            b.jmat.set_to_zero();
            for group in 0..width {
                let mut yp = y0.clone();
                for j in (group..n).step_by(width) {
                    let sig = b.dqrely * y0[j].abs().max(1.0 / ewt[j]);
                    yp[j] += sig;
                }
                b.ybuf.copy_from_slice(&yp);
                let ybuf = b.ybuf.clone();
                let gtmp = b.gtmp.clone();
                let flag = self.call_bbd_local(b, t, &ybuf, &gtmp);
                if flag != 0 {
                    return flag;
                }
                let gt = b.gtmp.to_vec();
                for j in (group..n).step_by(width) {
                    let sig = b.dqrely * y0[j].abs().max(1.0 / ewt[j]);
                    let lo = j.saturating_sub(b.mudq.min(b.mukeep));
                    let hi = (j + b.mldq.min(b.mlkeep)).min(n - 1);
                    for i in lo..=hi {
                        b.jmat.set(i, j, (gt[i] - g0[i]) / sig);
                    }
                }
            }
            b.have_j = true;
        }
        // P = I - gamma * J over the retained band, then factor
        let n = self.n;
        b.pmat.set_to_zero();
        for j in 0..n {
            let lo = j.saturating_sub(b.mukeep);
            let hi = (j + b.mlkeep).min(n - 1);
            for i in lo..=hi {
                let idm = if i == j { 1.0 } else { 0.0 };
                b.pmat.set(i, j, idm - gamma * b.jmat.get(i, j));
            }
        }
        if !b.pmat.factor() {
            b.factored = false;
            return 1;
        }
        b.factored = true;
        ENG_SUCCESS
    }

    #[must_use]
    pub fn bbd_get_work_space(&self) -> Option<(usize, usize)> {
        match &self.lin {
            LinMod::Spils(s) => s
                .bbd
                .as_ref()
                .map(|b| (b.nlocal * (2 * (b.mukeep + b.mlkeep + 1) + 3), b.nlocal)),
            _ => None,
        }
    }

    /// Local-function evaluations performed by the preconditioner.
    #[must_use]
    pub fn bbd_get_num_gloc_evals(&self) -> Option<u64> {
        match &self.lin {
            LinMod::Spils(s) => s.bbd.as_ref().map(|b| b.nge),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_bbd_prec(&self) -> bool {
        matches!(&self.lin, LinMod::Spils(s) if s.bbd.is_some())
    }
}
