#![forbid(unsafe_code)]

//! Linear-solver and preconditioner binding for forward sessions.
//!
//! Per-session state machine:
//! `{NoSolver, Direct(Dense|Band), Diagonal, Krylov(PrecNone|PrecUser|PrecBbd)}`.
//! Attaching a configuration replaces the callback-table variant wholesale
//! and re-registers exactly the trampolines that variant needs; nothing of
//! the previous configuration survives the transition.

use fsun_engine::{BandBlockBandwidths, Bandwidths, PrecType};
use fsun_nvec::{ScopedView, ScopedViewMut};

use crate::callbacks::{self, JacobianArg, SpilsSolveArg};
use crate::error::{check_flag, CallbackFailure, CbResult, SolverError};
use crate::session::{Session, SolverCallbacks};

impl Session {
    /// Attach the dense direct solver. Until a Jacobian callback is set the
    /// engine approximates the Jacobian by difference quotients.
    pub fn attach_dense(&self) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.attach_dense())?;
        check_flag("attach_dense", flag)?;
        self.shared.cbs.borrow_mut().solver = SolverCallbacks::Dense { jac: None };
        Ok(())
    }

    /// Register a dense Jacobian callback on the attached dense solver.
    pub fn set_dense_jac_fn<F>(&self, jac: F) -> Result<(), SolverError>
    where
        F: FnMut(JacobianArg, &fsun_engine::DenseMatrixView) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Dense { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("dense solver not attached"));
            };
            *slot = Some(Box::new(jac));
        }
        let flag =
            self.with_mem(|m| m.set_dense_jac_fn(Some(callbacks::dense_jac_trampoline)))?;
        check_flag("set_dense_jac_fn", flag)
    }

    /// Drop the dense Jacobian callback; a no-op when none is registered.
    pub fn clear_dense_jac_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Dense { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("dense solver not attached"));
            };
            *slot = None;
        }
        let flag = self.with_mem(|m| m.set_dense_jac_fn(None))?;
        check_flag("clear_dense_jac_fn", flag)
    }

    /// Attach the banded direct solver.
    pub fn attach_band(&self, bw: Bandwidths) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.attach_band(bw.mupper, bw.mlower))?;
        check_flag("attach_band", flag)?;
        self.shared.cbs.borrow_mut().solver = SolverCallbacks::Band { jac: None };
        Ok(())
    }

    pub fn set_band_jac_fn<F>(&self, jac: F) -> Result<(), SolverError>
    where
        F: FnMut(usize, usize, JacobianArg, &fsun_engine::BandMatrixView) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Band { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("band solver not attached"));
            };
            *slot = Some(Box::new(jac));
        }
        let flag = self.with_mem(|m| m.set_band_jac_fn(Some(callbacks::band_jac_trampoline)))?;
        check_flag("set_band_jac_fn", flag)
    }

    pub fn clear_band_jac_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Band { jac: slot } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("band solver not attached"));
            };
            *slot = None;
        }
        let flag = self.with_mem(|m| m.set_band_jac_fn(None))?;
        check_flag("clear_band_jac_fn", flag)
    }

    /// Attach the diagonal approximation solver; it has no callbacks.
    pub fn attach_diag(&self) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.attach_diag())?;
        check_flag("attach_diag", flag)?;
        self.shared.cbs.borrow_mut().solver = SolverCallbacks::Diag;
        Ok(())
    }

    /// Attach the Krylov iterative solver with no preconditioner installed
    /// yet. `maxl == 0` selects the engine default subspace size.
    pub fn attach_krylov(&self, pretype: PrecType, maxl: usize) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.attach_krylov(pretype, maxl))?;
        check_flag("attach_krylov", flag)?;
        self.shared.cbs.borrow_mut().solver = SolverCallbacks::Krylov {
            setup: None,
            solve: None,
            jtimes: None,
        };
        Ok(())
    }

    /// Register a preconditioner solve callback (no setup phase).
    pub fn set_preconditioner<S>(&self, solve: S) -> Result<(), SolverError>
    where
        S: FnMut(JacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Krylov {
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
        let flag =
            self.with_mem(|m| m.set_preconditioner(None, callbacks::prec_solve_trampoline))?;
        check_flag("set_preconditioner", flag)
    }

    /// Register a preconditioner setup/solve callback pair. The setup
    /// callback reports whether it refreshed its Jacobian-derived data.
    pub fn set_preconditioner_with_setup<P, S>(
        &self,
        setup: P,
        solve: S,
    ) -> Result<(), SolverError>
    where
        P: FnMut(JacobianArg, bool, f64) -> Result<bool, CallbackFailure> + 'static,
        S: FnMut(JacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Krylov {
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
        let flag = self.with_mem(|m| {
            m.set_preconditioner(
                Some(callbacks::prec_setup_trampoline),
                callbacks::prec_solve_trampoline,
            )
        })?;
        check_flag("set_preconditioner", flag)
    }

    /// Register a Jacobian-times-vector callback on the Krylov solver.
    pub fn set_jac_times_vec_fn<F>(&self, jtimes: F) -> Result<(), SolverError>
    where
        F: FnMut(JacobianArg, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Krylov { jtimes: slot, .. } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *slot = Some(Box::new(jtimes));
        }
        let flag =
            self.with_mem(|m| m.set_jac_times_vec_fn(Some(callbacks::jac_times_trampoline)))?;
        check_flag("set_jac_times_vec_fn", flag)
    }

    /// Drop the Jacobian-times-vector callback; a no-op when none is
    /// registered. The engine falls back to difference quotients.
    pub fn clear_jac_times_vec_fn(&self) -> Result<(), SolverError> {
        {
            let mut cbs = self.shared.cbs.borrow_mut();
            let SolverCallbacks::Krylov { jtimes: slot, .. } = &mut cbs.solver else {
                return Err(SolverError::InvalidArg("Krylov solver not attached"));
            };
            *slot = None;
        }
        let flag = self.with_mem(|m| m.set_jac_times_vec_fn(None))?;
        check_flag("clear_jac_times_vec_fn", flag)
    }

    /// Attach a Krylov solver with the band-block-diagonal preconditioner,
    /// supplying the local approximation function. `dqrely = None` selects
    /// the default relative increment (square root of unit roundoff).
    pub fn attach_krylov_bbd<L>(
        &self,
        pretype: PrecType,
        maxl: usize,
        bw: BandBlockBandwidths,
        dqrely: Option<f64>,
        local: L,
    ) -> Result<(), SolverError>
    where
        L: FnMut(f64, ScopedView, ScopedViewMut) -> CbResult + 'static,
    {
        self.attach_krylov_bbd_inner(pretype, maxl, bw, dqrely, Box::new(local), None)
    }

    /// As [`Session::attach_krylov_bbd`], with a cross-partition
    /// communication function invoked before the local function.
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
        L: FnMut(f64, ScopedView, ScopedViewMut) -> CbResult + 'static,
        C: FnMut(f64, ScopedView) -> CbResult + 'static,
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
        local: Box<callbacks::BbdLocalClosure>,
        comm: Option<Box<callbacks::BbdCommClosure>>,
    ) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.attach_krylov(pretype, maxl))?;
        check_flag("attach_krylov", flag)?;
        let nlocal = self.shared.neqs.get();
        let has_comm = comm.is_some();
        self.shared.cbs.borrow_mut().solver = SolverCallbacks::KrylovBbd { local, comm };
        let flag = self.with_mem(|m| {
            m.bbd_prec_init(
                nlocal,
                bw,
                dqrely.unwrap_or(0.0),
                callbacks::bbd_local_trampoline,
                has_comm.then_some(callbacks::bbd_comm_trampoline),
            )
        })?;
        if let Err(e) = check_flag("bbd_prec_init", flag) {
            // leave the table consistent with the engine: plain Krylov
            self.shared.cbs.borrow_mut().solver = SolverCallbacks::Krylov {
                setup: None,
                solve: None,
                jtimes: None,
            };
            return Err(e);
        }
        Ok(())
    }

    /// Adjust the difference-quotient bandwidths and relative increment of
    /// the band-block-diagonal preconditioner. Fails unless the BBD variant
    /// is the active configuration.
    pub fn reinit_preconditioner(
        &self,
        mudq: usize,
        mldq: usize,
        dqrely: Option<f64>,
    ) -> Result<(), SolverError> {
        {
            let cbs = self.shared.cbs.borrow();
            if !matches!(cbs.solver, SolverCallbacks::KrylovBbd { .. }) {
                return Err(SolverError::InvalidArg(
                    "band-block-diagonal preconditioner is not the active configuration",
                ));
            }
        }
        let flag = self.with_mem(|m| m.bbd_prec_reinit(mudq, mldq, dqrely.unwrap_or(0.0)))?;
        check_flag("bbd_prec_reinit", flag)
    }

    // ── Krylov tuning forwards ───────────────────────────────────

    pub fn set_prec_type(&self, pretype: PrecType) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_prec_type(pretype))?;
        check_flag("set_prec_type", flag)
    }

    pub fn set_eps_lin(&self, eplifac: f64) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_eps_lin(eplifac))?;
        check_flag("set_eps_lin", flag)
    }

    pub fn set_maxl(&self, maxl: usize) -> Result<(), SolverError> {
        let flag = self.with_mem(|m| m.set_maxl(maxl))?;
        check_flag("set_maxl", flag)
    }

    // ── per-solver statistics ────────────────────────────────────

    fn stat<T>(v: Option<T>) -> Result<T, SolverError> {
        v.ok_or(SolverError::InvalidArg(
            "statistic not available for the active linear solver",
        ))
    }

    pub fn dls_get_num_jac_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.dls_get_num_jac_evals())?)
    }

    pub fn dls_get_num_rhs_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.dls_get_num_rhs_evals())?)
    }

    pub fn dls_get_work_space(&self) -> Result<(usize, usize), SolverError> {
        Self::stat(self.with_mem_ref(|m| m.dls_get_work_space())?)
    }

    pub fn diag_get_work_space(&self) -> Result<(usize, usize), SolverError> {
        Self::stat(self.with_mem_ref(|m| m.diag_get_work_space())?)
    }

    pub fn diag_get_num_rhs_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.diag_get_num_rhs_evals())?)
    }

    pub fn spils_get_num_lin_iters(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_lin_iters())?)
    }

    pub fn spils_get_num_conv_fails(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_conv_fails())?)
    }

    pub fn spils_get_num_prec_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_prec_evals())?)
    }

    pub fn spils_get_num_prec_solves(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_prec_solves())?)
    }

    pub fn spils_get_num_jtimes_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_jtimes_evals())?)
    }

    pub fn spils_get_num_rhs_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_num_rhs_evals())?)
    }

    pub fn spils_get_work_space(&self) -> Result<(usize, usize), SolverError> {
        Self::stat(self.with_mem_ref(|m| m.spils_get_work_space())?)
    }

    pub fn bbd_get_work_space(&self) -> Result<(usize, usize), SolverError> {
        Self::stat(self.with_mem_ref(|m| m.bbd_get_work_space())?)
    }

    pub fn bbd_get_num_gloc_evals(&self) -> Result<u64, SolverError> {
        Self::stat(self.with_mem_ref(|m| m.bbd_get_num_gloc_evals())?)
    }
}
