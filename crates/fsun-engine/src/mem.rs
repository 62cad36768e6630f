#![forbid(unsafe_code)]

//! `EngineMem`: per-problem engine state and the public entry points that do
//! not involve stepping (creation, reinitialization, tolerances, options,
//! statistics). Backward problems are themselves `EngineMem` values nested
//! inside their parent.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::rc::Rc;

use fsun_nvec::RealBuffer;
use fsun_runtime::UNIT_ROUNDOFF;
use serde::{Deserialize, Serialize};

use crate::adjoint::{AdjointCtl, History, QuadCtl};
use crate::flags::*;
use crate::lsolve::LinMod;
use crate::types::{ErrHandlerFn, EwtFn, RhsFn, RhsFnB, RootsFn, UserToken};

/// Linear multistep family selected at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lmm {
    Adams,
    Bdf,
}

/// Stop condition for one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Step until the requested output time is reached (interpolating back).
    Normal,
    /// Take a single internal step and return.
    OneStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IterKind {
    Functional,
    Newton,
}

/// Absolute tolerance: one value for all components or one per component.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Atol {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Atol {
    pub(crate) fn get(&self, i: usize) -> f64 {
        match self {
            Atol::Scalar(v) => *v,
            Atol::Vector(v) => v[i],
        }
    }
}

/// Forward/backward right-hand-side dispatch. Backward problems receive the
/// interpolated forward state as an extra argument.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RhsDispatch {
    Fwd(RhsFn),
    Bwd(RhsFnB),
}

/// Context a backward problem needs to see its parent's trajectory.
#[derive(Debug)]
pub(crate) struct FwdCtx {
    pub(crate) hist: Rc<RefCell<History>>,
    pub(crate) yfwd: RealBuffer,
}

/// Integrator statistics record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegratorStats {
    pub steps: u64,
    pub rhs_evals: u64,
    pub linear_solver_setups: u64,
    pub error_test_failures: u64,
    pub last_internal_order: i32,
    pub next_internal_order: i32,
    pub initial_step_size: f64,
    pub last_step_size: f64,
    pub next_step_size: f64,
    pub internal_time: f64,
}

/// One integration problem's complete engine state.
#[derive(Debug)]
pub struct EngineMem {
    pub(crate) n: usize,
    pub(crate) lmm: Lmm,
    pub(crate) iter: IterKind,
    pub(crate) user_data: UserToken,
    pub(crate) rhs: Option<RhsDispatch>,
    pub(crate) fwd_ctx: Option<FwdCtx>,
    pub(crate) initialized: bool,
    pub(crate) first_call: bool,

    // current and previous step endpoints
    pub(crate) tn: f64,
    pub(crate) y: RealBuffer,
    pub(crate) ydot: RealBuffer,
    pub(crate) told: f64,
    pub(crate) yold: RealBuffer,
    pub(crate) ydold: RealBuffer,
    pub(crate) h: f64,
    pub(crate) hlast: f64,
    pub(crate) h0_used: f64,
    pub(crate) dir: f64,

    // tolerances and error weights
    pub(crate) rtol: f64,
    pub(crate) atol: Atol,
    pub(crate) ewt: RealBuffer,
    pub(crate) ewt_fn: Option<EwtFn>,

    // step workspace
    pub(crate) tmp1: RealBuffer,
    pub(crate) tmp2: RealBuffer,
    pub(crate) tmp3: RealBuffer,
    pub(crate) ypred: RealBuffer,
    pub(crate) xcor: RealBuffer,
    pub(crate) fnew: RealBuffer,
    pub(crate) acor: RealBuffer,

    // options
    pub(crate) hin: f64,
    pub(crate) hmin: f64,
    pub(crate) hmax: f64,
    pub(crate) mxstep: u64,
    pub(crate) mxhnil: u32,
    pub(crate) hnil_count: u32,
    pub(crate) stldet: bool,
    pub(crate) tstop: Option<f64>,
    pub(crate) max_etf: u32,
    pub(crate) maxcor: u32,
    pub(crate) max_ncf: u32,
    pub(crate) nlscoef: f64,
    pub(crate) maxord: u32,

    // counters
    pub(crate) nst: u64,
    pub(crate) nfe: u64,
    pub(crate) nsetups: u64,
    pub(crate) netf: u64,
    pub(crate) nni: u64,
    pub(crate) ncfn: u64,
    pub(crate) nge: u64,
    pub(crate) qlast: i32,
    pub(crate) qcur: i32,

    // root finding
    pub(crate) nroots: usize,
    pub(crate) roots_fn: Option<RootsFn>,
    pub(crate) glo: Vec<f64>,
    pub(crate) roots_found: Vec<i32>,
    pub(crate) root_dirs: Vec<i32>,
    pub(crate) no_inactive_warn: bool,
    pub(crate) gbuf: RealBuffer,

    // diagnostics
    pub(crate) errh: Option<ErrHandlerFn>,
    pub(crate) err_file: Option<File>,

    pub(crate) lin: LinMod,

    // adjoint machinery (parent side) and backward problems
    pub(crate) adj: Option<AdjointCtl>,
    pub(crate) backwards: Vec<EngineMem>,
    // quadrature extension, backward problems only
    pub(crate) quadb: Option<QuadCtl>,
    // last advance output kept for get_backward
    pub(crate) tret: f64,
    pub(crate) yret: Vec<f64>,
}

pub(crate) const DEFAULT_RTOL: f64 = 1.0e-4;
pub(crate) const DEFAULT_ATOL: f64 = 1.0e-8;
pub(crate) const DEFAULT_MXSTEP: u64 = 500;
pub(crate) const DEFAULT_MXHNIL: u32 = 10;
pub(crate) const DEFAULT_MAX_ETF: u32 = 7;
pub(crate) const DEFAULT_MAXCOR: u32 = 3;
pub(crate) const DEFAULT_MAX_NCF: u32 = 10;
pub(crate) const DEFAULT_NLSCOEF: f64 = 0.1;

impl EngineMem {
    /// Allocate an empty problem. `init` must be called before anything else.
    #[must_use]
    pub fn create(lmm: Lmm) -> Self {
        Self {
            n: 0,
            lmm,
            iter: IterKind::Functional,
            user_data: 0,
            rhs: None,
            fwd_ctx: None,
            initialized: false,
            first_call: true,
            tn: 0.0,
            y: RealBuffer::new(0),
            ydot: RealBuffer::new(0),
            told: 0.0,
            yold: RealBuffer::new(0),
            ydold: RealBuffer::new(0),
            h: 0.0,
            hlast: 0.0,
            h0_used: 0.0,
            dir: 1.0,
            rtol: DEFAULT_RTOL,
            atol: Atol::Scalar(DEFAULT_ATOL),
            ewt: RealBuffer::new(0),
            ewt_fn: None,
            tmp1: RealBuffer::new(0),
            tmp2: RealBuffer::new(0),
            tmp3: RealBuffer::new(0),
            ypred: RealBuffer::new(0),
            xcor: RealBuffer::new(0),
            fnew: RealBuffer::new(0),
            acor: RealBuffer::new(0),
            hin: 0.0,
            hmin: 0.0,
            hmax: f64::INFINITY,
            mxstep: DEFAULT_MXSTEP,
            mxhnil: DEFAULT_MXHNIL,
            hnil_count: 0,
            stldet: false,
            tstop: None,
            max_etf: DEFAULT_MAX_ETF,
            maxcor: DEFAULT_MAXCOR,
            max_ncf: DEFAULT_MAX_NCF,
            nlscoef: DEFAULT_NLSCOEF,
            maxord: 2,
            nst: 0,
            nfe: 0,
            nsetups: 0,
            netf: 0,
            nni: 0,
            ncfn: 0,
            nge: 0,
            qlast: 1,
            qcur: 1,
            nroots: 0,
            roots_fn: None,
            glo: Vec::new(),
            roots_found: Vec::new(),
            root_dirs: Vec::new(),
            no_inactive_warn: false,
            gbuf: RealBuffer::new(0),
            errh: None,
            err_file: None,
            lin: LinMod::None,
            adj: None,
            backwards: Vec::new(),
            quadb: None,
            tret: 0.0,
            yret: Vec::new(),
        }
    }

    /// Install the problem: right-hand side, initial time and state.
    pub fn init(&mut self, rhs: RhsFn, t0: f64, y0: &[f64]) -> i32 {
        self.rhs = Some(RhsDispatch::Fwd(rhs));
        self.init_state(t0, y0)
    }

    pub(crate) fn init_state(&mut self, t0: f64, y0: &[f64]) -> i32 {
        let n = y0.len();
        self.n = n;
        self.tn = t0;
        self.told = t0;
        self.y = RealBuffer::from_slice(y0);
        self.ydot = RealBuffer::new(n);
        self.yold = RealBuffer::from_slice(y0);
        self.ydold = RealBuffer::new(n);
        self.ewt = RealBuffer::new(n);
        self.tmp1 = RealBuffer::new(n);
        self.tmp2 = RealBuffer::new(n);
        self.tmp3 = RealBuffer::new(n);
        self.ypred = RealBuffer::new(n);
        self.xcor = RealBuffer::new(n);
        self.fnew = RealBuffer::new(n);
        self.acor = RealBuffer::new(n);
        self.yret = vec![0.0; n];
        self.initialized = true;
        self.first_call = true;
        self.hnil_count = 0;
        self.nst = 0;
        self.nfe = 0;
        self.nsetups = 0;
        self.netf = 0;
        self.nni = 0;
        self.ncfn = 0;
        self.nge = 0;
        self.qlast = 1;
        self.qcur = 1;
        ENG_SUCCESS
    }

    /// Reset integration state while keeping callbacks, tolerances, options
    /// and the attached linear solver.
    pub fn reinit(&mut self, t0: f64, y0: &[f64]) -> i32 {
        if !self.initialized {
            return ENG_NO_MALLOC;
        }
        if y0.len() != self.n {
            return ENG_ILL_INPUT;
        }
        self.tn = t0;
        self.told = t0;
        self.y.copy_from_slice(y0);
        self.yold.copy_from_slice(y0);
        self.ydot.fill(0.0);
        self.ydold.fill(0.0);
        self.first_call = true;
        self.hnil_count = 0;
        self.h = 0.0;
        self.hlast = 0.0;
        self.tstop = None;
        self.nst = 0;
        self.nfe = 0;
        self.nsetups = 0;
        self.netf = 0;
        self.nni = 0;
        self.ncfn = 0;
        self.nge = 0;
        if let Some(adj) = &self.adj {
            adj.hist.borrow_mut().clear();
        }
        ENG_SUCCESS
    }

    pub fn set_user_data(&mut self, token: UserToken) {
        self.user_data = token;
    }

    /// Register the root function with its component count.
    pub fn root_init(&mut self, nroots: usize, g: RootsFn) -> i32 {
        if !self.initialized {
            return ENG_NO_MALLOC;
        }
        self.nroots = nroots;
        self.roots_fn = Some(g);
        self.glo = vec![0.0; nroots];
        self.roots_found = vec![0; nroots];
        self.root_dirs = vec![0; nroots];
        self.gbuf = RealBuffer::new(nroots);
        ENG_SUCCESS
    }

    // ── tolerances ───────────────────────────────────────────────

    pub fn set_ss_tolerances(&mut self, rtol: f64, atol: f64) -> i32 {
        if rtol < 0.0 || atol < 0.0 {
            return ENG_ILL_INPUT;
        }
        self.rtol = rtol;
        self.atol = Atol::Scalar(atol);
        self.ewt_fn = None;
        ENG_SUCCESS
    }

    pub fn set_sv_tolerances(&mut self, rtol: f64, atol: &[f64]) -> i32 {
        if rtol < 0.0 || atol.len() != self.n || atol.iter().any(|&a| a < 0.0) {
            return ENG_ILL_INPUT;
        }
        self.rtol = rtol;
        self.atol = Atol::Vector(atol.to_vec());
        self.ewt_fn = None;
        ENG_SUCCESS
    }

    pub fn set_wf_tolerances(&mut self, efn: EwtFn) -> i32 {
        self.ewt_fn = Some(efn);
        ENG_SUCCESS
    }

    // ── diagnostics ──────────────────────────────────────────────

    pub fn set_err_handler(&mut self, h: ErrHandlerFn) {
        self.errh = Some(h);
    }

    pub fn clear_err_handler(&mut self) {
        self.errh = None;
    }

    pub fn set_error_file(&mut self, file: File) {
        self.err_file = Some(file);
    }

    pub(crate) fn report(&mut self, code: i32, function: &'static str, msg: &str) {
        if let Some(h) = self.errh {
            h(code, "FSUNENGINE", function, msg, self.user_data);
        }
        if let Some(f) = &mut self.err_file {
            let _ = writeln!(f, "[{function} {}] {msg}", flag_name(code));
        }
    }

    // ── iteration / option setters ───────────────────────────────

    pub fn set_functional(&mut self) {
        self.iter = IterKind::Functional;
        self.lin = LinMod::None;
    }

    pub fn set_max_ord(&mut self, maxord: u32) -> i32 {
        if maxord == 0 {
            return ENG_ILL_INPUT;
        }
        self.maxord = maxord.min(2);
        ENG_SUCCESS
    }

    pub fn set_max_num_steps(&mut self, mxstep: u64) -> i32 {
        self.mxstep = if mxstep == 0 { DEFAULT_MXSTEP } else { mxstep };
        ENG_SUCCESS
    }

    pub fn set_max_hnil_warns(&mut self, mxhnil: u32) -> i32 {
        self.mxhnil = mxhnil;
        ENG_SUCCESS
    }

    pub fn set_stab_lim_det(&mut self, stldet: bool) -> i32 {
        self.stldet = stldet;
        ENG_SUCCESS
    }

    pub fn set_init_step(&mut self, hin: f64) -> i32 {
        self.hin = hin;
        ENG_SUCCESS
    }

    pub fn set_min_step(&mut self, hmin: f64) -> i32 {
        if hmin < 0.0 || hmin > self.hmax {
            return ENG_ILL_INPUT;
        }
        self.hmin = hmin;
        ENG_SUCCESS
    }

    pub fn set_max_step(&mut self, hmax: f64) -> i32 {
        if hmax <= 0.0 || hmax < self.hmin {
            return ENG_ILL_INPUT;
        }
        self.hmax = hmax;
        ENG_SUCCESS
    }

    pub fn set_stop_time(&mut self, tstop: f64) -> i32 {
        self.tstop = Some(tstop);
        ENG_SUCCESS
    }

    pub fn set_max_err_test_fails(&mut self, maxnef: u32) -> i32 {
        if maxnef == 0 {
            return ENG_ILL_INPUT;
        }
        self.max_etf = maxnef;
        ENG_SUCCESS
    }

    pub fn set_max_nonlin_iters(&mut self, maxcor: u32) -> i32 {
        if maxcor == 0 {
            return ENG_ILL_INPUT;
        }
        self.maxcor = maxcor;
        ENG_SUCCESS
    }

    pub fn set_max_conv_fails(&mut self, maxncf: u32) -> i32 {
        if maxncf == 0 {
            return ENG_ILL_INPUT;
        }
        self.max_ncf = maxncf;
        ENG_SUCCESS
    }

    pub fn set_nonlin_conv_coef(&mut self, nlscoef: f64) -> i32 {
        if nlscoef <= 0.0 {
            return ENG_ILL_INPUT;
        }
        self.nlscoef = nlscoef;
        ENG_SUCCESS
    }

    pub fn set_root_direction(&mut self, dirs: &[i32]) -> i32 {
        if dirs.len() < self.nroots {
            return ENG_ILL_INPUT;
        }
        self.root_dirs.copy_from_slice(&dirs[..self.nroots]);
        ENG_SUCCESS
    }

    pub fn set_no_inactive_root_warn(&mut self) -> i32 {
        self.no_inactive_warn = true;
        ENG_SUCCESS
    }

    // ── queries ──────────────────────────────────────────────────

    #[must_use]
    pub fn neqs(&self) -> usize {
        self.n
    }

    #[must_use]
    pub fn num_roots(&self) -> usize {
        self.nroots
    }

    pub fn get_root_info(&self, out: &mut [i32]) -> i32 {
        if out.len() < self.nroots {
            return ENG_ILL_INPUT;
        }
        out[..self.nroots].copy_from_slice(&self.roots_found);
        ENG_SUCCESS
    }

    pub fn get_integrator_stats(&self) -> IntegratorStats {
        IntegratorStats {
            steps: self.nst,
            rhs_evals: self.nfe,
            linear_solver_setups: self.nsetups,
            error_test_failures: self.netf,
            last_internal_order: self.qlast,
            next_internal_order: self.qcur,
            initial_step_size: self.h0_used,
            last_step_size: self.hlast,
            next_step_size: self.h,
            internal_time: self.tn,
        }
    }

    /// Approximate real/integer workspace sizes, in words.
    #[must_use]
    pub fn get_work_space(&self) -> (usize, usize) {
        let lenrw = 96 + (self.maxord as usize + 5) * self.n + 3 * self.nroots;
        let leniw = 40 + self.nroots;
        (lenrw, leniw)
    }

    #[must_use]
    pub fn get_num_steps(&self) -> u64 {
        self.nst
    }

    #[must_use]
    pub fn get_num_rhs_evals(&self) -> u64 {
        self.nfe
    }

    #[must_use]
    pub fn get_num_lin_solv_setups(&self) -> u64 {
        self.nsetups
    }

    #[must_use]
    pub fn get_num_err_test_fails(&self) -> u64 {
        self.netf
    }

    #[must_use]
    pub fn get_last_order(&self) -> i32 {
        self.qlast
    }

    #[must_use]
    pub fn get_current_order(&self) -> i32 {
        self.qcur
    }

    #[must_use]
    pub fn get_actual_init_step(&self) -> f64 {
        self.h0_used
    }

    #[must_use]
    pub fn get_last_step(&self) -> f64 {
        self.hlast
    }

    #[must_use]
    pub fn get_current_step(&self) -> f64 {
        self.h
    }

    #[must_use]
    pub fn get_current_time(&self) -> f64 {
        self.tn
    }

    /// Suggested factor by which to scale tolerances when accuracy demands
    /// exceed machine precision.
    #[must_use]
    pub fn get_tol_scale_factor(&self) -> f64 {
        let umax = self.y.with(|y| y.iter().fold(0.0f64, |m, v| m.max(v.abs())));
        (UNIT_ROUNDOFF * umax / self.rtol.max(UNIT_ROUNDOFF)).max(1.0)
    }

    #[must_use]
    pub fn get_num_nonlin_solv_iters(&self) -> u64 {
        self.nni
    }

    #[must_use]
    pub fn get_num_nonlin_solv_conv_fails(&self) -> u64 {
        self.ncfn
    }

    #[must_use]
    pub fn get_num_g_evals(&self) -> u64 {
        self.nge
    }

    /// Number of order reductions forced by stability-limit detection.
    /// The detection algorithm only activates at orders above those this
    /// engine runs at, so the count is always zero.
    #[must_use]
    pub fn get_num_stab_lim_order_reds(&self) -> u64 {
        0
    }

    pub fn get_err_weights(&self, out: &mut [f64]) -> i32 {
        if out.len() != self.n {
            return ENG_ILL_INPUT;
        }
        self.ewt.copy_to(out);
        ENG_SUCCESS
    }

    pub fn get_est_local_errors(&self, out: &mut [f64]) -> i32 {
        if out.len() != self.n {
            return ENG_ILL_INPUT;
        }
        self.acor.copy_to(out);
        ENG_SUCCESS
    }
}
