#![forbid(unsafe_code)]

//! Callback table and dispatch trampolines.
//!
//! The engine registers plain `fn` pointers; each one here resolves the
//! user-data token back to its session, wraps the engine buffers in views
//! scoped to the invocation, calls the registered closure, and folds the
//! outcome through the status bridge. Buffer contents handed to a closure
//! are only valid during that call; the views enforce it.
//!
//! A trampoline is independent of which linear-solver variant is active;
//! the variant only decides whether the trampoline gets registered with the
//! engine at all.

use fsun_engine::{BandMatrix, BandMatrixView, DenseMatrix, DenseMatrixView, UserToken};
use fsun_nvec::{RealBuffer, ScopedView, ScopedViewMut, with_scope};

use crate::adjoint::BackwardSolverCallbacks;
use crate::error::{CallbackFailure, CbResult};
use crate::registry;
use crate::session::SolverCallbacks;
use crate::status::{run_guarded, run_guarded_bool};

// ── argument records ─────────────────────────────────────────────

/// Temporary workspace handed to a Jacobian-style callback: one or three
/// scratch vectors, per the engine's convention for that callback kind.
#[derive(Debug)]
pub enum Workspace {
    Single(ScopedViewMut),
    Triple(ScopedViewMut, ScopedViewMut, ScopedViewMut),
}

/// Arguments common to Jacobian and preconditioner callbacks.
#[derive(Debug)]
pub struct JacobianArg {
    pub t: f64,
    pub y: ScopedView,
    pub fy: ScopedView,
    pub tmp: Workspace,
}

/// Backward-problem analogue of [`JacobianArg`], carrying the interpolated
/// forward state alongside the backward state.
#[derive(Debug)]
pub struct BackwardJacobianArg {
    pub t: f64,
    pub y: ScopedView,
    pub yb: ScopedView,
    pub fyb: ScopedView,
    pub tmp: Workspace,
}

/// Extra arguments to the preconditioner solve callback.
#[derive(Debug)]
pub struct SpilsSolveArg {
    pub rhs: ScopedView,
    pub gamma: f64,
    pub delta: f64,
    pub left: bool,
}

/// Details delivered to the informational error-handler callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetails {
    pub error_code: i32,
    pub module_name: String,
    pub function_name: String,
    pub error_message: String,
}

// ── closure types stored in the callback tables ──────────────────

pub(crate) type RhsClosure = dyn FnMut(f64, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type RootsClosure = dyn FnMut(f64, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type ErrWeightClosure = dyn FnMut(ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type ErrHandlerClosure = dyn FnMut(ErrorDetails);
pub(crate) type DenseJacClosure = dyn FnMut(JacobianArg, &DenseMatrixView) -> CbResult;
pub(crate) type BandJacClosure = dyn FnMut(usize, usize, JacobianArg, &BandMatrixView) -> CbResult;
pub(crate) type PrecSetupClosure = dyn FnMut(JacobianArg, bool, f64) -> Result<bool, CallbackFailure>;
pub(crate) type PrecSolveClosure = dyn FnMut(JacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult;
pub(crate) type JacTimesClosure = dyn FnMut(JacobianArg, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type BbdLocalClosure = dyn FnMut(f64, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type BbdCommClosure = dyn FnMut(f64, ScopedView) -> CbResult;

pub(crate) type RhsBClosure = dyn FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type QuadRhsBClosure = dyn FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type DenseJacBClosure = dyn FnMut(BackwardJacobianArg, &DenseMatrixView) -> CbResult;
pub(crate) type BandJacBClosure =
    dyn FnMut(usize, usize, BackwardJacobianArg, &BandMatrixView) -> CbResult;
pub(crate) type PrecSetupBClosure =
    dyn FnMut(BackwardJacobianArg, bool, f64) -> Result<bool, CallbackFailure>;
pub(crate) type PrecSolveBClosure =
    dyn FnMut(BackwardJacobianArg, SpilsSolveArg, ScopedViewMut) -> CbResult;
pub(crate) type JacTimesBClosure =
    dyn FnMut(BackwardJacobianArg, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type BbdLocalBClosure = dyn FnMut(f64, ScopedView, ScopedView, ScopedViewMut) -> CbResult;
pub(crate) type BbdCommBClosure = dyn FnMut(f64, ScopedView, ScopedView) -> CbResult;

// ── forward trampolines ──────────────────────────────────────────

pub(crate) fn rhs_trampoline(t: f64, y: &RealBuffer, ydot: &RealBuffer, user: UserToken) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let dv = scope.view_mut(ydot);
        run_guarded(&sess.last_error, true, || {
            let mut cbs = sess.cbs.borrow_mut();
            (cbs.rhs)(t, yv, dv)
        })
    })
}

pub(crate) fn roots_trampoline(t: f64, y: &RealBuffer, gout: &RealBuffer, user: UserToken) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let gv = scope.view_mut(gout);
        run_guarded(&sess.last_error, false, || {
            let mut cbs = sess.cbs.borrow_mut();
            let g = cbs
                .roots
                .as_mut()
                .expect("internal error: root callback fired with no closure registered");
            g(t, yv, gv)
        })
    })
}

pub(crate) fn errw_trampoline(y: &RealBuffer, ewt: &RealBuffer, user: UserToken) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let wv = scope.view_mut(ewt);
        run_guarded(&sess.last_error, false, || {
            let mut cbs = sess.cbs.borrow_mut();
            let e = cbs
                .errw
                .as_mut()
                .expect("internal error: error-weight callback fired with no closure registered");
            e(yv, wv)
        })
    })
}

pub(crate) fn errh_trampoline(
    code: i32,
    module: &'static str,
    function: &'static str,
    msg: &str,
    user: UserToken,
) {
    let sess = registry::resolve_forward(user);
    let mut cbs = sess.cbs.borrow_mut();
    if let Some(h) = cbs.errh.as_mut() {
        // informational by design; the closure has no failure channel back
        // into the engine
        h(ErrorDetails {
            error_code: code,
            module_name: module.to_owned(),
            function_name: function.to_owned(),
            error_message: msg.to_owned(),
        });
    }
}

fn triple(
    scope: &mut fsun_nvec::CallbackScope,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
) -> Workspace {
    Workspace::Triple(
        scope.view_mut(tmp.0),
        scope.view_mut(tmp.1),
        scope.view_mut(tmp.2),
    )
}

pub(crate) fn dense_jac_trampoline(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jac: &DenseMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    let view = jac.view();
    let status = with_scope(|scope| {
        let arg = JacobianArg {
            t,
            y: scope.view(y),
            fy: scope.view(fy),
            tmp: triple(scope, tmp),
        };
        run_guarded(&sess.last_error, false, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::Dense { jac: Some(f) } = &mut cbs.solver else {
                panic!("internal error: dense Jacobian callback fired with no closure registered");
            };
            f(arg, &view)
        })
    });
    jac.relinquish();
    status
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn band_jac_trampoline(
    mupper: usize,
    mlower: usize,
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jac: &BandMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    let view = jac.view();
    let status = with_scope(|scope| {
        let arg = JacobianArg {
            t,
            y: scope.view(y),
            fy: scope.view(fy),
            tmp: triple(scope, tmp),
        };
        run_guarded(&sess.last_error, false, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::Band { jac: Some(f) } = &mut cbs.solver else {
                panic!("internal error: band Jacobian callback fired with no closure registered");
            };
            f(mupper, mlower, arg, &view)
        })
    });
    jac.relinquish();
    status
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn prec_setup_trampoline(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    jok: bool,
    jcur: &mut bool,
    gamma: f64,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let arg = JacobianArg {
            t,
            y: scope.view(y),
            fy: scope.view(fy),
            tmp: triple(scope, tmp),
        };
        run_guarded_bool(
            &sess.last_error,
            true,
            || {
                let mut cbs = sess.cbs.borrow_mut();
                let SolverCallbacks::Krylov { setup: Some(f), .. } = &mut cbs.solver else {
                    panic!(
                        "internal error: preconditioner setup callback fired with no closure registered"
                    );
                };
                f(arg, jok, gamma)
            },
            jcur,
        )
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn prec_solve_trampoline(
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    r: &RealBuffer,
    z: &RealBuffer,
    gamma: f64,
    delta: f64,
    left: bool,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let arg = JacobianArg {
            t,
            y: scope.view(y),
            fy: scope.view(fy),
            tmp: Workspace::Single(scope.view_mut(tmp)),
        };
        let solve_arg = SpilsSolveArg {
            rhs: scope.view(r),
            gamma,
            delta,
            left,
        };
        let zv = scope.view_mut(z);
        run_guarded(&sess.last_error, true, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::Krylov { solve: Some(f), .. } = &mut cbs.solver else {
                panic!(
                    "internal error: preconditioner solve callback fired with no closure registered"
                );
            };
            f(arg, solve_arg, zv)
        })
    })
}

pub(crate) fn jac_times_trampoline(
    v: &RealBuffer,
    jv: &RealBuffer,
    t: f64,
    y: &RealBuffer,
    fy: &RealBuffer,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let arg = JacobianArg {
            t,
            y: scope.view(y),
            fy: scope.view(fy),
            tmp: Workspace::Single(scope.view_mut(tmp)),
        };
        let vv = scope.view(v);
        let jvv = scope.view_mut(jv);
        run_guarded(&sess.last_error, true, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::Krylov { jtimes: Some(f), .. } = &mut cbs.solver else {
                panic!(
                    "internal error: Jacobian-times-vector callback fired with no closure registered"
                );
            };
            f(arg, vv, jvv)
        })
    })
}

pub(crate) fn bbd_local_trampoline(
    _nlocal: usize,
    t: f64,
    y: &RealBuffer,
    glocal: &RealBuffer,
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let gv = scope.view_mut(glocal);
        run_guarded(&sess.last_error, true, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::KrylovBbd { local, .. } = &mut cbs.solver else {
                panic!("internal error: BBD local callback fired with no closure registered");
            };
            local(t, yv, gv)
        })
    })
}

pub(crate) fn bbd_comm_trampoline(
    _nlocal: usize,
    t: f64,
    y: &RealBuffer,
    user: UserToken,
) -> i32 {
    let sess = registry::resolve_forward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        run_guarded(&sess.last_error, true, || {
            let mut cbs = sess.cbs.borrow_mut();
            let SolverCallbacks::KrylovBbd { comm: Some(f), .. } = &mut cbs.solver else {
                panic!("internal error: BBD communication callback fired with no closure registered");
            };
            f(t, yv)
        })
    })
}

// ── backward trampolines ─────────────────────────────────────────

pub(crate) fn rhs_b_trampoline(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    ybdot: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let ybv = scope.view(yb);
        let dv = scope.view_mut(ybdot);
        run_guarded(&b.last_error, true, || {
            let mut cbs = b.cbs.borrow_mut();
            (cbs.rhs)(t, yv, ybv, dv)
        })
    })
}

pub(crate) fn quad_b_trampoline(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    qbdot: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let ybv = scope.view(yb);
        let qv = scope.view_mut(qbdot);
        run_guarded(&b.last_error, false, || {
            let mut cbs = b.cbs.borrow_mut();
            let q = cbs
                .quad
                .as_mut()
                .expect("internal error: backward quadrature callback fired with no closure registered");
            q(t, yv, ybv, qv)
        })
    })
}

pub(crate) fn dense_jac_b_trampoline(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jac: &DenseMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    let view = jac.view();
    let status = with_scope(|scope| {
        let arg = BackwardJacobianArg {
            t,
            y: scope.view(y),
            yb: scope.view(yb),
            fyb: scope.view(fyb),
            tmp: triple(scope, tmp),
        };
        run_guarded(&b.last_error, false, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::Dense { jac: Some(f) } = &mut cbs.solver else {
                panic!(
                    "internal error: backward dense Jacobian callback fired with no closure registered"
                );
            };
            f(arg, &view)
        })
    });
    jac.relinquish();
    status
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn band_jac_b_trampoline(
    mupper: usize,
    mlower: usize,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jac: &BandMatrix,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    let view = jac.view();
    let status = with_scope(|scope| {
        let arg = BackwardJacobianArg {
            t,
            y: scope.view(y),
            yb: scope.view(yb),
            fyb: scope.view(fyb),
            tmp: triple(scope, tmp),
        };
        run_guarded(&b.last_error, false, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::Band { jac: Some(f) } = &mut cbs.solver else {
                panic!(
                    "internal error: backward band Jacobian callback fired with no closure registered"
                );
            };
            f(mupper, mlower, arg, &view)
        })
    });
    jac.relinquish();
    status
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn prec_setup_b_trampoline(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    jok: bool,
    jcur: &mut bool,
    gamma: f64,
    tmp: (&RealBuffer, &RealBuffer, &RealBuffer),
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let arg = BackwardJacobianArg {
            t,
            y: scope.view(y),
            yb: scope.view(yb),
            fyb: scope.view(fyb),
            tmp: triple(scope, tmp),
        };
        run_guarded_bool(
            &b.last_error,
            true,
            || {
                let mut cbs = b.cbs.borrow_mut();
                let BackwardSolverCallbacks::Krylov { setup: Some(f), .. } = &mut cbs.solver else {
                    panic!(
                        "internal error: backward preconditioner setup callback fired with no closure registered"
                    );
                };
                f(arg, jok, gamma)
            },
            jcur,
        )
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn prec_solve_b_trampoline(
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    r: &RealBuffer,
    z: &RealBuffer,
    gamma: f64,
    delta: f64,
    left: bool,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let arg = BackwardJacobianArg {
            t,
            y: scope.view(y),
            yb: scope.view(yb),
            fyb: scope.view(fyb),
            tmp: Workspace::Single(scope.view_mut(tmp)),
        };
        let solve_arg = SpilsSolveArg {
            rhs: scope.view(r),
            gamma,
            delta,
            left,
        };
        let zv = scope.view_mut(z);
        run_guarded(&b.last_error, true, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov { solve: Some(f), .. } = &mut cbs.solver else {
                panic!(
                    "internal error: backward preconditioner solve callback fired with no closure registered"
                );
            };
            f(arg, solve_arg, zv)
        })
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn jac_times_b_trampoline(
    v: &RealBuffer,
    jv: &RealBuffer,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    fyb: &RealBuffer,
    tmp: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let arg = BackwardJacobianArg {
            t,
            y: scope.view(y),
            yb: scope.view(yb),
            fyb: scope.view(fyb),
            tmp: Workspace::Single(scope.view_mut(tmp)),
        };
        let vv = scope.view(v);
        let jvv = scope.view_mut(jv);
        run_guarded(&b.last_error, true, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::Krylov { jtimes: Some(f), .. } = &mut cbs.solver else {
                panic!(
                    "internal error: backward Jacobian-times-vector callback fired with no closure registered"
                );
            };
            f(arg, vv, jvv)
        })
    })
}

pub(crate) fn bbd_local_b_trampoline(
    _nlocal: usize,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    gblocal: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let ybv = scope.view(yb);
        let gv = scope.view_mut(gblocal);
        run_guarded(&b.last_error, true, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::KrylovBbd { local, .. } = &mut cbs.solver else {
                panic!("internal error: backward BBD local callback fired with no closure registered");
            };
            local(t, yv, ybv, gv)
        })
    })
}

pub(crate) fn bbd_comm_b_trampoline(
    _nlocal: usize,
    t: f64,
    y: &RealBuffer,
    yb: &RealBuffer,
    user: UserToken,
) -> i32 {
    let b = registry::resolve_backward(user);
    with_scope(|scope| {
        let yv = scope.view(y);
        let ybv = scope.view(yb);
        run_guarded(&b.last_error, true, || {
            let mut cbs = b.cbs.borrow_mut();
            let BackwardSolverCallbacks::KrylovBbd { comm: Some(f), .. } = &mut cbs.solver else {
                panic!(
                    "internal error: backward BBD communication callback fired with no closure registered"
                );
            };
            f(t, yv, ybv)
        })
    })
}
