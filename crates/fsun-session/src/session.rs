#![forbid(unsafe_code)]

//! Forward integration sessions.
//!
//! A [`Session`] owns the engine handle for one problem, the mutable
//! callback table, and the single-slot error capture. The engine never sees
//! the session directly; it carries the registry token (the weak
//! self-reference) and reaches closures only through the trampolines.
//!
//! The call stack is synchronous and re-entrant: `advance` enters the
//! engine, the engine calls back into the closures. Closures must not call
//! back into engine-entering operations on the same session; the runtime
//! rejects such re-entry with a borrow panic.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::path::Path;
use std::rc::Rc;

use fsun_engine::flags::*;
use fsun_engine::{
    Bandwidths, EngineMem, IntegratorStats, Lmm, PrecType, StepMode, UserToken,
};
use fsun_nvec::{ScopedView, ScopedViewMut};

use crate::adjoint::BackwardShared;
use crate::callbacks::{
    self, BandJacClosure, BbdCommClosure, BbdLocalClosure, DenseJacClosure, ErrHandlerClosure,
    ErrWeightClosure, ErrorDetails, JacTimesClosure, PrecSetupClosure, PrecSolveClosure,
    RhsClosure, RootsClosure,
};
use crate::error::{check_flag, from_flag, CbResult, SolverError};
use crate::registry;
use crate::status::ErrorSlot;

/// Default tolerance pair installed at session creation.
pub const DEFAULT_TOLERANCES: (f64, f64) = (1.0e-4, 1.0e-8);

/// Nonlinear iteration choice made at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iter {
    /// Fixed-point corrector iteration; no linear solver involved.
    Functional,
    /// Newton iteration with the given linear solver.
    Newton(LinearSolverSpec),
}

/// Parameter-only linear solver selection usable at session creation.
/// Callback-carrying configurations (user preconditioners, BBD) are
/// attached afterwards through the dedicated methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverSpec {
    Dense,
    Band(Bandwidths),
    Diag,
    Krylov { pretype: PrecType, maxl: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub lmm: Lmm,
    pub iter: Iter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lmm: Lmm::Bdf,
            iter: Iter::Newton(LinearSolverSpec::Dense),
        }
    }
}

/// How an `advance` call came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverOutcome {
    Continue,
    RootsFound,
    StopTimeReached,
}

/// The active linear-solver variant with its registered closures. Switching
/// solvers replaces the whole variant; stale callbacks from a previous
/// configuration cannot survive the transition.
pub(crate) enum SolverCallbacks {
    NoSolver,
    Dense {
        jac: Option<Box<DenseJacClosure>>,
    },
    Band {
        jac: Option<Box<BandJacClosure>>,
    },
    Diag,
    Krylov {
        setup: Option<Box<PrecSetupClosure>>,
        solve: Option<Box<PrecSolveClosure>>,
        jtimes: Option<Box<JacTimesClosure>>,
    },
    KrylovBbd {
        local: Box<BbdLocalClosure>,
        comm: Option<Box<BbdCommClosure>>,
    },
}

pub(crate) struct CallbackTable {
    pub(crate) rhs: Box<RhsClosure>,
    pub(crate) roots: Option<Box<RootsClosure>>,
    pub(crate) errh: Option<Box<ErrHandlerClosure>>,
    pub(crate) errw: Option<Box<ErrWeightClosure>>,
    pub(crate) solver: SolverCallbacks,
}

pub(crate) struct SessionShared {
    pub(crate) token: Cell<UserToken>,
    pub(crate) mem: RefCell<Option<EngineMem>>,
    pub(crate) cbs: RefCell<CallbackTable>,
    pub(crate) last_error: ErrorSlot,
    pub(crate) neqs: Cell<usize>,
    pub(crate) nroots: Cell<usize>,
    pub(crate) children: RefCell<Vec<Rc<BackwardShared>>>,
}

/// A forward integration session.
pub struct Session {
    pub(crate) shared: Rc<SessionShared>,
}

impl Session {
    /// Create a session: allocate the engine problem, register the
    /// mandatory right-hand-side callback, install the weak self-reference
    /// as engine user data, attach the configured solver, and set the
    /// default tolerance pair.
    pub fn init<F>(
        config: SessionConfig,
        t0: f64,
        y0: &[f64],
        rhs: F,
    ) -> Result<Session, SolverError>
    where
        F: FnMut(f64, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        Self::init_inner(config, t0, y0, Box::new(rhs), 0, None)
    }

    /// As [`Session::init`], additionally registering a root function with
    /// `nroots` components.
    pub fn init_with_roots<F, G>(
        config: SessionConfig,
        t0: f64,
        y0: &[f64],
        rhs: F,
        nroots: usize,
        roots: G,
    ) -> Result<Session, SolverError>
    where
        F: FnMut(f64, ScopedView, ScopedViewMut) -> CbResult + 'static,
        G: FnMut(f64, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        Self::init_inner(config, t0, y0, Box::new(rhs), nroots, Some(Box::new(roots)))
    }

    fn init_inner(
        config: SessionConfig,
        t0: f64,
        y0: &[f64],
        rhs: Box<RhsClosure>,
        nroots: usize,
        roots: Option<Box<RootsClosure>>,
    ) -> Result<Session, SolverError> {
        if y0.is_empty() {
            return Err(SolverError::InvalidArg("initial state must be non-empty"));
        }
        let shared = Rc::new(SessionShared {
            token: Cell::new(0),
            mem: RefCell::new(None),
            cbs: RefCell::new(CallbackTable {
                rhs,
                roots,
                errh: None,
                errw: None,
                solver: SolverCallbacks::NoSolver,
            }),
            last_error: ErrorSlot::new(None),
            neqs: Cell::new(y0.len()),
            nroots: Cell::new(nroots),
            children: RefCell::new(Vec::new()),
        });
        let token = registry::register_forward(&shared);
        shared.token.set(token);

        let mut mem = EngineMem::create(config.lmm);
        let flag = mem.init(callbacks::rhs_trampoline, t0, y0);
        if flag != ENG_SUCCESS {
            registry::unregister(token);
            return Err(SolverError::EngineInitFailure("engine allocation failed"));
        }
        mem.set_user_data(token);
        if nroots > 0 {
            let flag = mem.root_init(nroots, callbacks::roots_trampoline);
            if flag != ENG_SUCCESS {
                registry::unregister(token);
                return Err(from_flag("root_init", flag));
            }
        }
        let flag = mem.set_ss_tolerances(DEFAULT_TOLERANCES.0, DEFAULT_TOLERANCES.1);
        if flag != ENG_SUCCESS {
            registry::unregister(token);
            return Err(from_flag("set_ss_tolerances", flag));
        }
        *shared.mem.borrow_mut() = Some(mem);

        let session = Session { shared };
        match config.iter {
            Iter::Functional => {
                session.with_mem(|m| m.set_functional())?;
            }
            Iter::Newton(spec) => session.attach_spec(spec)?,
        }
        Ok(session)
    }

    fn attach_spec(&self, spec: LinearSolverSpec) -> Result<(), SolverError> {
        match spec {
            LinearSolverSpec::Dense => self.attach_dense(),
            LinearSolverSpec::Band(bw) => self.attach_band(bw),
            LinearSolverSpec::Diag => self.attach_diag(),
            LinearSolverSpec::Krylov { pretype, maxl } => self.attach_krylov(pretype, maxl),
        }
    }

    pub(crate) fn with_mem<R>(
        &self,
        f: impl FnOnce(&mut EngineMem) -> R,
    ) -> Result<R, SolverError> {
        let mut guard = self.shared.mem.borrow_mut();
        match guard.as_mut() {
            Some(m) => Ok(f(m)),
            None => Err(SolverError::SessionClosed),
        }
    }

    pub(crate) fn with_mem_ref<R>(
        &self,
        f: impl FnOnce(&EngineMem) -> R,
    ) -> Result<R, SolverError> {
        let guard = self.shared.mem.borrow();
        match guard.as_ref() {
            Some(m) => Ok(f(m)),
            None => Err(SolverError::SessionClosed),
        }
    }

    pub(crate) fn forward_flag(&self, call: &'static str, flag: i32) -> Result<(), SolverError> {
        if let Some(err) = self.shared.last_error.borrow_mut().take() {
            return Err(SolverError::CallbackFailed(err));
        }
        check_flag(call, flag)
    }

    /// Number of equations in the problem.
    #[must_use]
    pub fn neqs(&self) -> usize {
        self.shared.neqs.get()
    }

    /// Number of root-function components.
    #[must_use]
    pub fn nroots(&self) -> usize {
        self.shared.nroots.get()
    }

    /// Whether the session has been destroyed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.mem.borrow().is_none()
    }

    // ── driving ──────────────────────────────────────────────────

    /// Integrate until `tout` is reached, interpolating the output back to
    /// exactly `tout`.
    pub fn advance_normal(
        &self,
        tout: f64,
        yout: &mut [f64],
    ) -> Result<(f64, SolverOutcome), SolverError> {
        self.advance(tout, yout, StepMode::Normal)
    }

    /// Take a single internal step toward `tout`.
    pub fn advance_one_step(
        &self,
        tout: f64,
        yout: &mut [f64],
    ) -> Result<(f64, SolverOutcome), SolverError> {
        self.advance(tout, yout, StepMode::OneStep)
    }

    fn advance(
        &self,
        tout: f64,
        yout: &mut [f64],
        mode: StepMode,
    ) -> Result<(f64, SolverOutcome), SolverError> {
        if yout.len() != self.shared.neqs.get() {
            return Err(SolverError::InvalidArg("output slice has the wrong length"));
        }
        let (tret, flag) = self.with_mem(|m| m.advance(tout, yout, mode))?;
        // a captured host error takes precedence over the raw status code,
        // which in that case only says "unrecoverable failure"
        if let Some(err) = self.shared.last_error.borrow_mut().take() {
            return Err(SolverError::CallbackFailed(err));
        }
        match flag {
            ENG_SUCCESS => Ok((tret, SolverOutcome::Continue)),
            ENG_ROOT_RETURN => Ok((tret, SolverOutcome::RootsFound)),
            ENG_TSTOP_RETURN => Ok((tret, SolverOutcome::StopTimeReached)),
            f => Err(from_flag("advance", f)),
        }
    }

    /// Reset integration history to `(t0, y0)` while keeping the callback
    /// table, tolerances and linear-solver configuration.
    pub fn reinit(&self, t0: f64, y0: &[f64]) -> Result<(), SolverError> {
        if y0.len() != self.shared.neqs.get() {
            return Err(SolverError::InvalidArg(
                "reinit state has a different problem size",
            ));
        }
        let flag = self.with_mem(|m| m.reinit(t0, y0))?;
        check_flag("reinit", flag)
    }

    /// Release the engine handle and invalidate every backward child.
    /// Subsequent operations fail with [`SolverError::SessionClosed`].
    pub fn destroy(&self) {
        for child in self.shared.children.borrow_mut().drain(..) {
            child.closed.set(true);
            registry::unregister(child.token.get());
        }
        if self.shared.mem.borrow_mut().take().is_some() {
            registry::unregister(self.shared.token.get());
        }
    }

    // ── tolerances ───────────────────────────────────────────────

    pub fn ss_tolerances(&self, rtol: f64, atol: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_ss_tolerances(rtol, atol))?;
        check_flag("set_ss_tolerances", flag)
    }

    pub fn sv_tolerances(&self, rtol: f64, atol: &[f64]) -> Result<(), SolverError> {
        if atol.len() != self.shared.neqs.get() {
            return Err(SolverError::InvalidArg("atol vector has the wrong length"));
        }
        let flag = self.with_mem(|m| m.set_sv_tolerances(rtol, atol))?;
        check_flag("set_sv_tolerances", flag)
    }

    /// Install a user error-weight function in place of the tolerance pair.
    pub fn wf_tolerances<E>(&self, efn: E) -> Result<(), SolverError>
    where
        E: FnMut(ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        self.shared.cbs.borrow_mut().errw = Some(Box::new(efn));
        let flag = self.with_mem(|m| m.set_wf_tolerances(callbacks::errw_trampoline))?;
        check_flag("set_wf_tolerances", flag)
    }

    // ── diagnostics ──────────────────────────────────────────────

    /// Install an informational error handler. Failures inside the handler
    /// have no channel back into the engine by design.
    pub fn set_err_handler<H>(&self, handler: H) -> Result<(), SolverError>
    where
        H: FnMut(ErrorDetails) + 'static,
    {
        self.shared.cbs.borrow_mut().errh = Some(Box::new(handler));
        self.with_mem(|m| m.set_err_handler(callbacks::errh_trampoline))
    }

    pub fn clear_err_handler(&self) -> Result<(), SolverError> {
        self.with_mem(|m| m.clear_err_handler())?;
        self.shared.cbs.borrow_mut().errh = None;
        Ok(())
    }

    /// Attach a path for the engine's own textual diagnostics; the content
    /// is opaque to this layer.
    pub fn set_error_file(&self, path: &Path, truncate: bool) -> Result<(), SolverError> {
        let file = if truncate {
            OpenOptions::new().create(true).write(true).truncate(true).open(path)?
        } else {
            OpenOptions::new().create(true).append(true).open(path)?
        };
        self.with_mem(|m| m.set_error_file(file))
    }

    // ── integration options (thin forwards) ──────────────────────

    pub fn set_max_ord(&self, maxord: u32) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_ord(maxord))?;
        check_flag("set_max_ord", flag)
    }

    pub fn set_max_num_steps(&self, mxsteps: u64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_num_steps(mxsteps))?;
        check_flag("set_max_num_steps", flag)
    }

    pub fn set_max_hnil_warns(&self, mxhnil: u32) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_hnil_warns(mxhnil))?;
        check_flag("set_max_hnil_warns", flag)
    }

    pub fn set_stab_lim_det(&self, stldet: bool) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_stab_lim_det(stldet))?;
        check_flag("set_stab_lim_det", flag)
    }

    pub fn set_init_step(&self, hin: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_init_step(hin))?;
        check_flag("set_init_step", flag)
    }

    pub fn set_min_step(&self, hmin: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_min_step(hmin))?;
        check_flag("set_min_step", flag)
    }

    pub fn set_max_step(&self, hmax: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_step(hmax))?;
        check_flag("set_max_step", flag)
    }

    pub fn set_stop_time(&self, tstop: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_stop_time(tstop))?;
        check_flag("set_stop_time", flag)
    }

    pub fn set_max_err_test_fails(&self, maxnef: u32) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_err_test_fails(maxnef))?;
        check_flag("set_max_err_test_fails", flag)
    }

    pub fn set_max_nonlin_iters(&self, maxcor: u32) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_nonlin_iters(maxcor))?;
        check_flag("set_max_nonlin_iters", flag)
    }

    pub fn set_max_conv_fails(&self, maxncf: u32) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_max_conv_fails(maxncf))?;
        check_flag("set_max_conv_fails", flag)
    }

    pub fn set_nonlin_conv_coef(&self, nlscoef: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_nonlin_conv_coef(nlscoef))?;
        check_flag("set_nonlin_conv_coef", flag)
    }

    pub fn set_root_direction(&self, dirs: &[i32]) -> Result<(), SolverError> {
        if dirs.len() < self.shared.nroots.get() {
            return Err(SolverError::InvalidArg("root directions array is too short"));
        }
        let flag = self.with_mem(|m| m.set_root_direction(dirs))?;
        check_flag("set_root_direction", flag)
    }

    pub fn set_no_inactive_root_warn(&self) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_no_inactive_root_warn())?;
        check_flag("set_no_inactive_root_warn", flag)
    }

    // ── queries ──────────────────────────────────────────────────

    /// `k`-th derivative of the interpolating polynomial at `t` within the
    /// last internal step.
    pub fn get_dky(&self, t: f64, k: usize) -> Result<Vec<f64>, SolverError> {
        let n = self.shared.neqs.get();
        let (flag, out) = self.with_mem_ref(|m| {
            let mut out = vec![0.0; n];
            let flag = m.get_dky(t, k, &mut out);
            (flag, out)
        })?;
        check_flag("get_dky", flag)?;
        Ok(out)
    }

    /// Which root components fired at the last `RootsFound` return:
    /// `+1` rising, `-1` falling, `0` quiet.
    pub fn get_root_info(&self) -> Result<Vec<i32>, SolverError> {
        let n = self.shared.nroots.get();
        let (flag, out) = self.with_mem_ref(|m| {
            let mut out = vec![0i32; n];
            let flag = m.get_root_info(&mut out);
            (flag, out)
        })?;
        check_flag("get_root_info", flag)?;
        Ok(out)
    }

    pub fn get_integrator_stats(&self) -> Result<IntegratorStats, SolverError> {
        self.with_mem_ref(|m| m.get_integrator_stats())
    }

    pub fn get_work_space(&self) -> Result<(usize, usize), SolverError> {
        self.with_mem_ref(|m| m.get_work_space())
    }

    pub fn get_num_steps(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_steps())
    }

    pub fn get_num_rhs_evals(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_rhs_evals())
    }

    pub fn get_num_lin_solv_setups(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_lin_solv_setups())
    }

    pub fn get_num_err_test_fails(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_err_test_fails())
    }

    pub fn get_last_order(&self) -> Result<i32, SolverError> {
        self.with_mem_ref(|m| m.get_last_order())
    }

    pub fn get_current_order(&self) -> Result<i32, SolverError> {
        self.with_mem_ref(|m| m.get_current_order())
    }

    pub fn get_actual_init_step(&self) -> Result<f64, SolverError> {
        self.with_mem_ref(|m| m.get_actual_init_step())
    }

    pub fn get_last_step(&self) -> Result<f64, SolverError> {
        self.with_mem_ref(|m| m.get_last_step())
    }

    pub fn get_current_step(&self) -> Result<f64, SolverError> {
        self.with_mem_ref(|m| m.get_current_step())
    }

    pub fn get_current_time(&self) -> Result<f64, SolverError> {
        self.with_mem_ref(|m| m.get_current_time())
    }

    pub fn get_tol_scale_factor(&self) -> Result<f64, SolverError> {
        self.with_mem_ref(|m| m.get_tol_scale_factor())
    }

    pub fn get_num_nonlin_solv_iters(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_nonlin_solv_iters())
    }

    pub fn get_num_nonlin_solv_conv_fails(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_nonlin_solv_conv_fails())
    }

    pub fn get_num_g_evals(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_g_evals())
    }

    pub fn get_num_stab_lim_order_reds(&self) -> Result<u64, SolverError> {
        self.with_mem_ref(|m| m.get_num_stab_lim_order_reds())
    }

    pub fn get_err_weights(&self) -> Result<Vec<f64>, SolverError> {
        let n = self.shared.neqs.get();
        let (flag, out) = self.with_mem_ref(|m| {
            let mut out = vec![0.0; n];
            let flag = m.get_err_weights(&mut out);
            (flag, out)
        })?;
        check_flag("get_err_weights", flag)?;
        Ok(out)
    }

    pub fn get_est_local_errors(&self) -> Result<Vec<f64>, SolverError> {
        let n = self.shared.neqs.get();
        let (flag, out) = self.with_mem_ref(|m| {
            let mut out = vec![0.0; n];
            let flag = m.get_est_local_errors(&mut out);
            (flag, out)
        })?;
        check_flag("get_est_local_errors", flag)?;
        Ok(out)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("neqs", &self.shared.neqs.get())
            .field("nroots", &self.shared.nroots.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}
