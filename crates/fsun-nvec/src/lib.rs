#![forbid(unsafe_code)]

//! Real-valued buffers owned by the solver engine, and the scope-bounded
//! views through which user callbacks see them.
//!
//! The engine reuses buffer storage across steps and hands it to callbacks
//! only for the duration of a single invocation. A [`ScopedView`] therefore
//! carries the buffer's *epoch* at wrap time; when the enclosing
//! [`CallbackScope`] is dropped the epoch advances, and any later access
//! through a retained view panics instead of reading stale data.
//!
//! | Type              | Role                                               |
//! |-------------------|----------------------------------------------------|
//! | [`RealBuffer`]    | Shared storage handle, engine side                 |
//! | [`ScopedView`]    | Read-only element access, one callback invocation  |
//! | [`ScopedViewMut`] | Writable element access, one callback invocation   |
//! | [`CallbackScope`] | RAII guard that invalidates every wrapped view     |

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug)]
struct BufferCell {
    data: RefCell<Vec<f64>>,
    epoch: Cell<u64>,
}

/// A real vector whose storage belongs to the solver engine.
///
/// Cloning a `RealBuffer` clones the handle, not the storage; the engine and
/// the dispatch layer share one underlying allocation.
#[derive(Debug, Clone)]
pub struct RealBuffer {
    cell: Rc<BufferCell>,
}

impl RealBuffer {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_slice(&vec![0.0; len])
    }

    #[must_use]
    pub fn from_slice(values: &[f64]) -> Self {
        Self {
            cell: Rc::new(BufferCell {
                data: RefCell::new(values.to_vec()),
                epoch: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cell.data.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the current contents.
    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        f(&self.cell.data.borrow())
    }

    /// Run `f` over the current contents, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        f(&mut self.cell.data.borrow_mut())
    }

    pub fn fill(&self, c: f64) {
        self.with_mut(|d| d.fill(c));
    }

    pub fn copy_from_slice(&self, src: &[f64]) {
        self.with_mut(|d| d.copy_from_slice(src));
    }

    pub fn copy_to(&self, dst: &mut [f64]) {
        self.with(|d| dst.copy_from_slice(d));
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        self.cell.data.borrow().clone()
    }

    /// Two handles are aliases when they share storage.
    #[must_use]
    pub fn same_storage(&self, other: &RealBuffer) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    fn current_epoch(&self) -> u64 {
        self.cell.epoch.get()
    }

    fn bump_epoch(&self) {
        self.cell.epoch.set(self.cell.epoch.get().wrapping_add(1));
    }
}

fn check_epoch(cell: &BufferCell, wrapped_at: u64) {
    assert!(
        cell.epoch.get() == wrapped_at,
        "scoped view used after its callback returned"
    );
}

/// Read-only view over an engine buffer, valid for one callback invocation.
#[derive(Debug, Clone)]
pub struct ScopedView {
    cell: Rc<BufferCell>,
    wrapped_at: u64,
}

impl ScopedView {
    #[must_use]
    pub fn len(&self) -> usize {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element access. Panics if the view has been invalidated or the index
    /// is out of range.
    #[must_use]
    pub fn get(&self, i: usize) -> f64 {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow()[i]
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow().clone()
    }

    pub fn copy_to(&self, dst: &mut [f64]) {
        check_epoch(&self.cell, self.wrapped_at);
        dst.copy_from_slice(&self.cell.data.borrow());
    }

    /// Run `f` over the viewed elements without copying.
    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        check_epoch(&self.cell, self.wrapped_at);
        f(&self.cell.data.borrow())
    }
}

/// Writable view over an engine buffer, valid for one callback invocation.
#[derive(Debug)]
pub struct ScopedViewMut {
    cell: Rc<BufferCell>,
    wrapped_at: u64,
}

impl ScopedViewMut {
    #[must_use]
    pub fn len(&self) -> usize {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, i: usize) -> f64 {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow()[i]
    }

    pub fn set(&mut self, i: usize, v: f64) {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow_mut()[i] = v;
    }

    pub fn fill(&mut self, c: f64) {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow_mut().fill(c);
    }

    pub fn copy_from_slice(&mut self, src: &[f64]) {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow_mut().copy_from_slice(src);
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        check_epoch(&self.cell, self.wrapped_at);
        self.cell.data.borrow().clone()
    }

    /// Run `f` over the viewed elements, mutably, without copying.
    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        check_epoch(&self.cell, self.wrapped_at);
        f(&mut self.cell.data.borrow_mut())
    }
}

/// Tracks every buffer wrapped during one callback invocation and
/// invalidates their views when dropped, including on unwind.
#[derive(Debug, Default)]
pub struct CallbackScope {
    wrapped: Vec<Rc<BufferCell>>,
}

impl CallbackScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `buf` as a read-only view tied to this scope.
    #[must_use]
    pub fn view(&mut self, buf: &RealBuffer) -> ScopedView {
        self.wrapped.push(Rc::clone(&buf.cell));
        ScopedView {
            cell: Rc::clone(&buf.cell),
            wrapped_at: buf.current_epoch(),
        }
    }

    /// Wrap `buf` as a writable view tied to this scope.
    #[must_use]
    pub fn view_mut(&mut self, buf: &RealBuffer) -> ScopedViewMut {
        self.wrapped.push(Rc::clone(&buf.cell));
        ScopedViewMut {
            cell: Rc::clone(&buf.cell),
            wrapped_at: buf.current_epoch(),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        for cell in &self.wrapped {
            cell.epoch.set(cell.epoch.get().wrapping_add(1));
        }
    }
}

/// Run `body` with a fresh scope; every view handed out through it is
/// invalidated when `body` returns or unwinds.
pub fn with_scope<R>(body: impl FnOnce(&mut CallbackScope) -> R) -> R {
    let mut scope = CallbackScope::new();
    body(&mut scope)
}

impl RealBuffer {
    /// Invalidate all outstanding views of this buffer without going through
    /// a scope. Used by the engine when it reclaims storage wholesale.
    pub fn relinquish(&self) {
        self.bump_epoch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvec_buffer_roundtrip() {
        let b = RealBuffer::from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.to_vec(), vec![1.0, 2.0, 3.0]);
        b.fill(0.5);
        assert_eq!(b.to_vec(), vec![0.5, 0.5, 0.5]);
    }

    #[test]
    fn test_nvec_view_reads_through_to_storage() {
        let b = RealBuffer::from_slice(&[1.0, 2.0]);
        with_scope(|scope| {
            let v = scope.view(&b);
            assert_eq!(v.get(0), 1.0);
            assert_eq!(v.get(1), 2.0);
        });
    }

    #[test]
    fn test_nvec_view_mut_writes_through_to_storage() {
        let b = RealBuffer::new(2);
        with_scope(|scope| {
            let mut v = scope.view_mut(&b);
            v.set(0, 7.0);
            v.set(1, -7.0);
        });
        assert_eq!(b.to_vec(), vec![7.0, -7.0]);
    }

    #[test]
    #[should_panic(expected = "used after its callback returned")]
    fn test_nvec_retained_view_detected() {
        let b = RealBuffer::from_slice(&[1.0]);
        let leaked = with_scope(|scope| scope.view(&b));
        let _ = leaked.get(0);
    }

    #[test]
    #[should_panic(expected = "used after its callback returned")]
    fn test_nvec_retained_view_mut_detected() {
        let b = RealBuffer::from_slice(&[1.0]);
        let mut leaked = with_scope(|scope| scope.view_mut(&b));
        leaked.set(0, 2.0);
    }

    #[test]
    fn test_nvec_view_valid_within_scope_even_after_other_scope_closes() {
        let b = RealBuffer::from_slice(&[4.0]);
        // A scope over an unrelated buffer must not invalidate b's views.
        let other = RealBuffer::new(1);
        with_scope(|scope| {
            let v = scope.view(&b);
            with_scope(|inner| {
                let _ = inner.view(&other);
            });
            assert_eq!(v.get(0), 4.0);
        });
    }

    #[test]
    fn test_nvec_relinquish_invalidates() {
        let b = RealBuffer::from_slice(&[1.0]);
        let mut scope = CallbackScope::new();
        let v = scope.view(&b);
        b.relinquish();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| v.get(0)));
        assert!(r.is_err(), "access after relinquish must panic");
        // Keep the scope alive past the check so only relinquish is tested.
        drop(scope);
    }

    #[test]
    fn test_nvec_same_storage() {
        let b = RealBuffer::new(3);
        let alias = b.clone();
        let distinct = RealBuffer::new(3);
        assert!(b.same_storage(&alias));
        assert!(!b.same_storage(&distinct));
    }
}
