#![forbid(unsafe_code)]

//! Token registry: the weak self-reference the engine carries as user data.
//!
//! The engine cannot hold a reference into host-managed memory, so each
//! session registers itself in a thread-local arena and hands the engine an
//! integer token. Trampolines resolve the token back to the session. A
//! token that resolves to a vacant slot or a dead weak reference is a
//! lifetime bug in the binding, never a user error, so resolution panics
//! instead of returning a recoverable failure.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use fsun_engine::UserToken;

use crate::adjoint::BackwardShared;
use crate::session::SessionShared;

pub(crate) enum Registered {
    Forward(Weak<SessionShared>),
    Backward(Weak<BackwardShared>),
}

thread_local! {
    static REGISTRY: RefCell<Vec<Option<Registered>>> = const { RefCell::new(Vec::new()) };
}

fn insert(entry: Registered) -> UserToken {
    REGISTRY.with(|r| {
        let mut slots = r.borrow_mut();
        if let Some(idx) = slots.iter().position(Option::is_none) {
            slots[idx] = Some(entry);
            idx as UserToken
        } else {
            slots.push(Some(entry));
            (slots.len() - 1) as UserToken
        }
    })
}

pub(crate) fn register_forward(s: &Rc<SessionShared>) -> UserToken {
    insert(Registered::Forward(Rc::downgrade(s)))
}

pub(crate) fn register_backward(s: &Rc<BackwardShared>) -> UserToken {
    insert(Registered::Backward(Rc::downgrade(s)))
}

pub(crate) fn unregister(token: UserToken) {
    REGISTRY.with(|r| {
        let mut slots = r.borrow_mut();
        if let Some(slot) = slots.get_mut(token as usize) {
            *slot = None;
        }
    });
}

pub(crate) fn resolve_forward(token: UserToken) -> Rc<SessionShared> {
    REGISTRY.with(|r| {
        let slots = r.borrow();
        match slots.get(token as usize) {
            Some(Some(Registered::Forward(w))) => w
                .upgrade()
                .expect("internal error: weak session reference is dead"),
            Some(Some(Registered::Backward(_))) => {
                panic!("internal error: forward callback routed to a backward session token")
            }
            _ => panic!("internal error: callback fired with an unregistered session token"),
        }
    })
}

pub(crate) fn resolve_backward(token: UserToken) -> Rc<BackwardShared> {
    REGISTRY.with(|r| {
        let slots = r.borrow();
        match slots.get(token as usize) {
            Some(Some(Registered::Backward(w))) => w
                .upgrade()
                .expect("internal error: weak session reference is dead"),
            Some(Some(Registered::Forward(_))) => {
                panic!("internal error: backward callback routed to a forward session token")
            }
            _ => panic!("internal error: callback fired with an unregistered session token"),
        }
    })
}
