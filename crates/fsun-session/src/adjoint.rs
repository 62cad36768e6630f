#![forbid(unsafe_code)]

//! Backward/adjoint sessions.
//!
//! A [`BackwardSession`] owns no engine handle. It is a logical child
//! addressed by `(parent, which)`: the parent's engine state holds the
//! actual backward problem, and `which` is the only identity the engine
//! uses when routing backward callbacks. The parent keeps an owning list of
//! its children so that destroying the parent invalidates them all at once;
//! the child keeps only a weak back-reference and its index.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use fsun_engine::{BandBlockBandwidths, Bandwidths, IntegratorStats, Lmm, PrecType, UserToken};
use fsun_nvec::{ScopedView, ScopedViewMut};

use crate::callbacks::{
    self, BackwardJacobianArg, BandJacBClosure, BbdCommBClosure, BbdLocalBClosure,
    DenseJacBClosure, JacTimesBClosure, PrecSetupBClosure, PrecSolveBClosure, QuadRhsBClosure,
    RhsBClosure, SpilsSolveArg,
};
use crate::error::{check_flag, from_flag, CallbackFailure, CbResult, SolverError};
use crate::registry;
use crate::session::{Session, SessionShared};
use crate::status::ErrorSlot;

/// The backward analogue of the forward solver-callback variant set.
pub(crate) enum BackwardSolverCallbacks {
    NoSolver,
    Dense {
        jac: Option<Box<DenseJacBClosure>>,
    },
    Band {
        jac: Option<Box<BandJacBClosure>>,
    },
    Diag,
    Krylov {
        setup: Option<Box<PrecSetupBClosure>>,
        solve: Option<Box<PrecSolveBClosure>>,
        jtimes: Option<Box<JacTimesBClosure>>,
    },
    KrylovBbd {
        local: Box<BbdLocalBClosure>,
        comm: Option<Box<BbdCommBClosure>>,
    },
}

pub(crate) struct BackwardCallbackTable {
    pub(crate) rhs: Box<RhsBClosure>,
    pub(crate) quad: Option<Box<QuadRhsBClosure>>,
    pub(crate) solver: BackwardSolverCallbacks,
}

pub(crate) struct BackwardShared {
    pub(crate) token: Cell<UserToken>,
    pub(crate) parent: Weak<SessionShared>,
    pub(crate) which: Cell<usize>,
    pub(crate) nbeqs: Cell<usize>,
    pub(crate) nquad: Cell<usize>,
    pub(crate) cbs: RefCell<BackwardCallbackTable>,
    pub(crate) last_error: ErrorSlot,
    pub(crate) closed: Cell<bool>,
}

/// A backward (adjoint) session, valid only as long as its parent.
pub struct BackwardSession {
    pub(crate) shared: Rc<BackwardShared>,
}

impl Session {
    /// Enable adjoint checkpointing; every subsequent `forward_*` call
    /// records the trajectory for later backward interpolation.
    pub fn adj_init(&self, steps_per_checkpoint: usize) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.adj_init(steps_per_checkpoint))?;
        check_flag("adj_init", flag)
    }

    /// Forward integration with checkpointing; returns `(t_reached, ncheck)`.
    pub fn forward_normal(
        &self,
        tout: f64,
        yout: &mut [f64],
    ) -> Result<(f64, usize), SolverError> {
        self.forward(tout, yout, fsun_engine::StepMode::Normal)
    }

    /// One checkpointed internal step; returns `(t_reached, ncheck)`.
    pub fn forward_one_step(
        &self,
        tout: f64,
        yout: &mut [f64],
    ) -> Result<(f64, usize), SolverError> {
        self.forward(tout, yout, fsun_engine::StepMode::OneStep)
    }

    fn forward(
        &self,
        tout: f64,
        yout: &mut [f64],
        mode: fsun_engine::StepMode,
    ) -> Result<(f64, usize), SolverError> {
        if yout.len() != self.neqs() {
            return Err(SolverError::InvalidArg("output slice has the wrong length"));
        }
        let (tret, ncheck, flag) = self.with_mem(|m| m.forward(tout, yout, mode))?;
        self.forward_flag("forward", flag)?;
        Ok((tret, ncheck as usize))
    }

    /// Create a backward problem on this session. The parent assigns the
    /// next sequential index; the trampolines use that index's token, not
    /// the parent's, so callbacks route to the right child.
    pub fn init_backward<F>(
        &self,
        lmm: Lmm,
        tb0: f64,
        yb0: &[f64],
        rhs: F,
    ) -> Result<BackwardSession, SolverError>
    where
        F: FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        if yb0.is_empty() {
            return Err(SolverError::InvalidArg("initial state must be non-empty"));
        }
        let bshared = Rc::new(BackwardShared {
            token: Cell::new(0),
            parent: Rc::downgrade(&self.shared),
            which: Cell::new(0),
            nbeqs: Cell::new(yb0.len()),
            nquad: Cell::new(0),
            cbs: RefCell::new(BackwardCallbackTable {
                rhs: Box::new(rhs),
                quad: None,
                solver: BackwardSolverCallbacks::NoSolver,
            }),
            last_error: ErrorSlot::new(None),
            closed: Cell::new(false),
        });
        let token = registry::register_backward(&bshared);
        bshared.token.set(token);

        let (which, flag) =
            self.with_mem(|m| m.init_backward(lmm, callbacks::rhs_b_trampoline, tb0, yb0))?;
        if flag != fsun_engine::flags::ENG_SUCCESS {
            registry::unregister(token);
            return Err(from_flag("init_backward", flag));
        }
        bshared.which.set(which);
        let flag = self.with_mem(|m| m.set_user_data_b(which, token))?;
        check_flag("set_user_data_b", flag)?;

        self.shared.children.borrow_mut().push(Rc::clone(&bshared));
        Ok(BackwardSession { shared: bshared })
    }

    /// Integrate every backward problem down to `tbout`.
    pub fn backward_normal(&self, tbout: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.backward(tbout))?;
        // replay child-captured errors ahead of the raw status code
        for child in self.shared.children.borrow().iter() {
            if let Some(err) = child.last_error.borrow_mut().take() {
                return Err(SolverError::CallbackFailed(err));
            }
        }
        self.forward_flag("backward", flag)
    }

    /// Number of backward problems created on this session.
    pub fn num_backward_problems(&self) -> Result<usize, SolverError> {
        self.with_mem_ref(|m| m.num_backward_problems())
    }
}

impl BackwardSession {
    /// Index assigned by the parent; the engine-side identity of this child.
    #[must_use]
    pub fn which(&self) -> usize {
        self.shared.which.get()
    }

    /// Number of equations in the backward problem.
    #[must_use]
    pub fn neqs(&self) -> usize {
        self.shared.nbeqs.get()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get() || self.shared.parent.upgrade().is_none()
    }

    fn parent(&self) -> Result<Rc<SessionShared>, SolverError> {
        if self.shared.closed.get() {
            return Err(SolverError::SessionClosed);
        }
        self.shared.parent.upgrade().ok_or(SolverError::SessionClosed)
    }

    fn with_parent_mem<R>(
        &self,
        f: impl FnOnce(&mut fsun_engine::EngineMem) -> R,
    ) -> Result<R, SolverError> {
        let parent = self.parent()?;
        let mut guard = parent.mem.borrow_mut();
        match guard.as_mut() {
            Some(m) => Ok(f(m)),
            None => Err(SolverError::SessionClosed),
        }
    }

    fn with_parent_mem_ref<R>(
        &self,
        f: impl FnOnce(&fsun_engine::EngineMem) -> R,
    ) -> Result<R, SolverError> {
        let parent = self.parent()?;
        let guard = parent.mem.borrow();
        match guard.as_ref() {
            Some(m) => Ok(f(m)),
            None => Err(SolverError::SessionClosed),
        }
    }

    /// Solution of this backward problem at the last `backward_normal`
    /// return: `(t, yB)`.
    pub fn get(&self) -> Result<(f64, Vec<f64>), SolverError> {
        let which = self.which();
        let n = self.neqs();
        let (t, flag, out) = self.with_parent_mem_ref(|m| {
            let mut out = vec![0.0; n];
            let (t, flag) = m.get_backward(which, &mut out);
            (t, flag, out)
        })?;
        check_flag("get_backward", flag)?;
        Ok((t, out))
    }

    // ── tolerances ───────────────────────────────────────────────

    pub fn ss_tolerances(&self, rtol: f64, atol: f64) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.set_ss_tolerances_b(which, rtol, atol))?;
        check_flag("set_ss_tolerances_b", flag)
    }

    pub fn sv_tolerances(&self, rtol: f64, atol: &[f64]) -> Result<(), SolverError> {
        if atol.len() != self.neqs() {
            return Err(SolverError::InvalidArg("atol vector has the wrong length"));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.set_sv_tolerances_b(which, rtol, atol))?;
        check_flag("set_sv_tolerances_b", flag)
    }

    // ── linear solvers ───────────────────────────────────────────

    pub fn attach_dense(&self) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.attach_dense_b(which))?;
        check_flag("attach_dense_b", flag)?;
        self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::Dense { jac: None };
        Ok(())
    }

    pub fn set_dense_jac_fn<F>(&self, jac: F) -> Result<(), SolverError>
    where
        F: FnMut(BackwardJacobianArg, &fsun_engine::DenseMatrixView) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Dense { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("dense solver not attached"));
            };
            *slot = Some(Box::new(jac));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| {
            m.set_dense_jac_fn_b(which, Some(callbacks::dense_jac_b_trampoline))
        })?;
        check_flag("set_dense_jac_fn_b", flag)
    }

    pub fn clear_dense_jac_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Dense { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("dense solver not attached"));
            };
            *slot = None;
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.set_dense_jac_fn_b(which, None))?;
        check_flag("clear_dense_jac_fn_b", flag)
    }

    pub fn attach_band(&self, bw: Bandwidths) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.attach_band_b(which, bw.mupper, bw.mlower))?;
        check_flag("attach_band_b", flag)?;
        self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::Band { jac: None };
        Ok(())
    }

    pub fn set_band_jac_fn<F>(&self, jac: F) -> Result<(), SolverError>
    where
        F: FnMut(usize, usize, BackwardJacobianArg, &fsun_engine::BandMatrixView) -> CbResult
            + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Band { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("band solver not attached"));
            };
            *slot = Some(Box::new(jac));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| {
            m.set_band_jac_fn_b(which, Some(callbacks::band_jac_b_trampoline))
        })?;
        check_flag("set_band_jac_fn_b", flag)
    }

    pub fn clear_band_jac_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Band { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("band solver not attached"));
            };
            *slot = None;
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.set_band_jac_fn_b(which, None))?;
        check_flag("clear_band_jac_fn_b", flag)
    }

    pub fn attach_diag(&self) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.attach_diag_b(which))?;
        check_flag("attach_diag_b", flag)?;
        self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::Diag;
        Ok(())
    }

    pub fn attach_krylov(&self, pretype: PrecType, maxl: usize) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.attach_krylov_b(which, pretype, maxl))?;
        check_flag("attach_krylov_b", flag)?;
        self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::Krylov {
            setup: None,
            solve: None,
            jtimes: None,
        };
        Ok(())
    }

    pub fn set_preconditioner<S>(&self, solve: S) -> Result<(), SolverError>
    where
        S: FnMut(BackwardJacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov {
                setup: setup_slot,
                solve: solve_slot,
                ..
            } = &mut cbs.solver
            else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *setup_slot = None;
            *solve_slot = Some(Box::new(solve));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| {
            m.set_preconditioner_b(which, None, callbacks::prec_solve_b_trampoline)
        })?;
        check_flag("set_preconditioner_b", flag)
    }

    pub fn set_preconditioner_with_setup<P, S>(
        &self,
        setup: P,
        solve: S,
    ) -> Result<(), SolverError>
    where
        P: FnMut(BackwardJacobianArg, bool, f64) -> Result<bool, CallbackFailure> + 'static,
        S: FnMut(BackwardJacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov {
                setup: setup_slot,
                solve: solve_slot,
                ..
            } = &mut cbs.solver
            else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *setup_slot = Some(Box::new(setup));
            *solve_slot = Some(Box::new(solve));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| {
            m.set_preconditioner_b(
                which,
                Some(callbacks::prec_setup_b_trampoline),
                callbacks::prec_solve_b_trampoline,
            )
        })?;
        check_flag("set_preconditioner_b", flag)
    }

    pub fn set_jac_times_vec_fn<F>(&self, jtimes: F) -> Result<(), SolverError>
    where
        F: FnMut(BackwardJacobianArg, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov { jtimes: slot, .. } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *slot = Some(Box::new(jtimes));
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| {
            m.set_jac_times_vec_fn_b(which, Some(callbacks::jac_times_b_trampoline))
        })?;
        check_flag("set_jac_times_vec_fn_b", flag)
    }

    pub fn clear_jac_times_vec_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov { jtimes: slot, .. } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *slot = None;
        }
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.set_jac_times_vec_fn_b(which, None))?;
        check_flag("clear_jac_times_vec_fn_b", flag)
    }

    /// Attach a Krylov solver with the band-block-diagonal preconditioner
    /// on this backward problem.
    pub fn attach_krylov_bbd<L>(
        &self,
        pretype: PrecType,
        maxl: usize,
        bw: BandBlockBandwidths,
        dqrely: Option<f64>,
        local: L,
    ) -> Result<(), SolverError>
    where
        L: FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        self.attach_krylov_bbd_inner(pretype, maxl, bw, dqrely, Box::new(local), None)
    }

    pub fn attach_krylov_bbd_with_comm<L, C>(
        &self,
        pretype: PrecType,
        maxl: usize,
        bw: BandBlockBandwidths,
        dqrely: Option<f64>,
        local: L,
        comm: C,
    ) -> Result<(), SolverError>
    where
        L: FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult + 'static,
        C: FnMut(f64, ScopedView, ScopedView) -> CbResult + 'static,
    {
        self.attach_krylov_bbd_inner(
            pretype,
            maxl,
            bw,
            dqrely,
            Box::new(local),
            Some(Box::new(comm)),
        )
    }

    fn attach_krylov_bbd_inner(
        &self,
        pretype: PrecType,
        maxl: usize,
        bw: BandBlockBandwidths,
        dqrely: Option<f64>,
        local: Box<BbdLocalBClosure>,
        comm: Option<Box<BbdCommBClosure>>,
    ) -> Result<(), SolverError> {
        let which = self.which();
        let flag = self.with_parent_mem(|m| m.attach_krylov_b(which, pretype, maxl))?;
        check_flag("attach_krylov_b", flag)?;
        let nlocal = self.neqs();
        let has_comm = comm.is_some();
        self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::KrylovBbd { local, comm };
        let flag = self.with_parent_mem(|m| {
            m.bbd_prec_init_b(
                which,
                nlocal,
                bw,
                dqrely.unwrap_or(0.0),
                callbacks::bbd_local_b_trampoline,
                has_comm.then_some(callbacks::bbd_comm_b_trampoline),
            )
        })?;
        if let Err(e) = check_flag("bbd_prec_init_b", flag) {
            self.shared.cbs.borrow_mut().solver = BackwardSolverCallbacks::Krylov {
                setup: None,
                solve: None,
                jtimes: None,
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn reinit_preconditioner(
        &self,
        mudq: usize,
        mldq: usize,
        dqrely: Option<f64>,
    ) -> Result<(), SolverError> {
        {
            let cbs = self.shared.cbs.borrow();
            if !matches!(cbs.solver, BackwardSolverCallbacks::KrylovBbd { .. }) {
                return Err(SolverError::InvalidArg(
                    "band-block-diagonal preconditioner is not the active configuration",
                ));
            }
        }
        let which = self.which();
        let flag =
            self.with_parent_mem(|m| m.bbd_prec_reinit_b(which, mudq, mldq, dqrely.unwrap_or(0.0)))?;
        check_flag("bbd_prec_reinit_b", flag)
    }

    // ── quadrature extension ─────────────────────────────────────

    /// Attach a quadrature right-hand side integrated alongside the
    /// backward state.
    pub fn quad_init<F>(&self, yq0: &[f64], qrhs: F) -> Result<(), SolverError>
    where
        F: FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        self.shared.cbs.borrow_mut().quad = Some(Box::new(qrhs));
        self.shared.nquad.set(yq0.len());
        let which = self.which();
        let flag =
            self.with_parent_mem(|m| m.quad_init_b(which, callbacks::quad_b_trampoline, yq0))?;
        check_flag("quad_init_b", flag)
    }

    /// Quadrature state at the current backward time: `(t, yQ)`.
    pub fn quad_get(&self) -> Result<(f64, Vec<f64>), SolverError> {
        let which = self.which();
        let nq = self.shared.nquad.get();
        if nq == 0 {
            return Err(SolverError::InvalidArg("quadrature not initialized"));
        }
        let (t, flag, out) = self.with_parent_mem_ref(|m| {
            let mut out = vec![0.0; nq];
            let (t, flag) = m.get_quad_b(which, &mut out);
            (t, flag, out)
        })?;
        check_flag("get_quad_b", flag)?;
        Ok((t, out))
    }

    pub fn num_quad_rhs_evals(&self) -> Result<u64, SolverError> {
        let which = self.which();
        self.with_parent_mem_ref(|m| m.get_num_quad_rhs_evals_b(which))?
            .ok_or(SolverError::InvalidArg("quadrature not initialized"))
    }

    /// Integrator statistics of the underlying backward problem.
    pub fn get_integrator_stats(&self) -> Result<IntegratorStats, SolverError> {
        let which = self.which();
        self.with_parent_mem_ref(|m| m.get_integrator_stats_b(which))?
            .ok_or(SolverError::InvalidArg("no backward problem with that index"))
    }
}

impl std::fmt::Debug for BackwardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackwardSession")
            .field("which", &self.shared.which.get())
            .field("neqs", &self.shared.nbeqs.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}
