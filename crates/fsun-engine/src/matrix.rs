#![forbid(unsafe_code)]

//! Dense and banded Jacobian storage.
//!
//! Matrices handed to user Jacobian callbacks go out through a *view* that
//! carries a validity epoch, exactly like the vector views: once the
//! callback returns, the engine advances the epoch and any retained view
//! panics on access.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use nalgebra::DMatrix;

#[derive(Debug)]
struct DenseCell {
    m: usize,
    n: usize,
    // column-major
    data: RefCell<Vec<f64>>,
    epoch: Cell<u64>,
}

/// Column-major dense matrix, engine-owned.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    cell: Rc<DenseCell>,
}

impl DenseMatrix {
    #[must_use]
    pub fn new(m: usize, n: usize) -> Self {
        Self {
            cell: Rc::new(DenseCell {
                m,
                n,
                data: RefCell::new(vec![0.0; m * n]),
                epoch: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.cell.m
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cell.n
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        assert!(i < self.cell.m, "DenseMatrix.get: invalid i.");
        assert!(j < self.cell.n, "DenseMatrix.get: invalid j.");
        self.cell.data.borrow()[j * self.cell.m + i]
    }

    pub fn set(&self, i: usize, j: usize, v: f64) {
        assert!(i < self.cell.m, "DenseMatrix.set: invalid i.");
        assert!(j < self.cell.n, "DenseMatrix.set: invalid j.");
        self.cell.data.borrow_mut()[j * self.cell.m + i] = v;
    }

    pub fn set_to_zero(&self) {
        self.cell.data.borrow_mut().fill(0.0);
    }

    /// Write one full column at once (used by difference-quotient setup).
    pub fn set_column(&self, j: usize, col: &[f64]) {
        assert!(j < self.cell.n, "DenseMatrix.set_column: invalid j.");
        assert_eq!(col.len(), self.cell.m, "DenseMatrix.set_column: bad length.");
        let m = self.cell.m;
        self.cell.data.borrow_mut()[j * m..(j + 1) * m].copy_from_slice(col);
    }

    #[must_use]
    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_column_slice(self.cell.m, self.cell.n, &self.cell.data.borrow())
    }

    /// Hand out a callback-scoped view.
    #[must_use]
    pub fn view(&self) -> DenseMatrixView {
        DenseMatrixView {
            cell: Rc::clone(&self.cell),
            wrapped_at: self.cell.epoch.get(),
        }
    }

    /// Invalidate all outstanding views.
    pub fn relinquish(&self) {
        self.cell.epoch.set(self.cell.epoch.get().wrapping_add(1));
    }
}

/// Callback-scoped accessor over a [`DenseMatrix`].
#[derive(Debug)]
pub struct DenseMatrixView {
    cell: Rc<DenseCell>,
    wrapped_at: u64,
}

impl DenseMatrixView {
    fn check(&self) {
        assert!(
            self.cell.epoch.get() == self.wrapped_at,
            "matrix view used after its callback returned"
        );
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.check();
        self.cell.m
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.check();
        self.cell.n
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.check();
        assert!(i < self.cell.m, "DenseMatrix.get: invalid i.");
        assert!(j < self.cell.n, "DenseMatrix.get: invalid j.");
        self.cell.data.borrow()[j * self.cell.m + i]
    }

    pub fn set(&self, i: usize, j: usize, v: f64) {
        self.check();
        assert!(i < self.cell.m, "DenseMatrix.set: invalid i.");
        assert!(j < self.cell.n, "DenseMatrix.set: invalid j.");
        self.cell.data.borrow_mut()[j * self.cell.m + i] = v;
    }

    pub fn set_to_zero(&self) {
        self.check();
        self.cell.data.borrow_mut().fill(0.0);
    }
}

#[derive(Debug)]
struct BandCell {
    n: usize,
    mupper: usize,
    mlower: usize,
    // column-major, (mupper + mlower + 1) band rows per column
    data: RefCell<Vec<f64>>,
    epoch: Cell<u64>,
}

impl BandCell {
    fn width(&self) -> usize {
        self.mupper + self.mlower + 1
    }

    fn idx(&self, i: usize, j: usize) -> Option<usize> {
        let lo = j.saturating_sub(self.mupper);
        let hi = (j + self.mlower).min(self.n - 1);
        if i < lo || i > hi {
            return None;
        }
        Some(j * self.width() + (i + self.mupper - j))
    }
}

/// Banded matrix, engine-owned. Element `(i, j)` is stored only when
/// `j - mupper <= i <= j + mlower`.
#[derive(Debug, Clone)]
pub struct BandMatrix {
    cell: Rc<BandCell>,
}

impl BandMatrix {
    #[must_use]
    pub fn new(n: usize, mupper: usize, mlower: usize) -> Self {
        let width = mupper + mlower + 1;
        Self {
            cell: Rc::new(BandCell {
                n,
                mupper,
                mlower,
                data: RefCell::new(vec![0.0; n * width]),
                epoch: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.cell.n
    }

    #[must_use]
    pub fn mupper(&self) -> usize {
        self.cell.mupper
    }

    #[must_use]
    pub fn mlower(&self) -> usize {
        self.cell.mlower
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        assert!(i < self.cell.n, "BandMatrix.get: invalid i");
        assert!(j < self.cell.n, "BandMatrix.get: invalid j");
        match self.cell.idx(i, j) {
            Some(k) => self.cell.data.borrow()[k],
            None => 0.0,
        }
    }

    pub fn set(&self, i: usize, j: usize, v: f64) {
        assert!(i < self.cell.n, "BandMatrix.set: invalid i");
        assert!(j < self.cell.n, "BandMatrix.set: invalid j");
        let k = self
            .cell
            .idx(i, j)
            .expect("BandMatrix.set: element outside the band");
        self.cell.data.borrow_mut()[k] = v;
    }

    pub fn set_to_zero(&self) {
        self.cell.data.borrow_mut().fill(0.0);
    }

    /// In-place LU factorization without pivoting. Returns false on a zero
    /// pivot (the caller treats that as a recoverable setup failure).
    #[must_use]
    pub fn factor(&self) -> bool {
        let n = self.cell.n;
        let mu = self.cell.mupper;
        let ml = self.cell.mlower;
        let mut data = self.cell.data.borrow_mut();
        let width = mu + ml + 1;
        let at = |data: &Vec<f64>, i: usize, j: usize| data[j * width + (i + mu - j)];
        for k in 0..n {
            let piv = at(&data, k, k);
            if piv == 0.0 || !piv.is_finite() {
                return false;
            }
            let imax = (k + ml).min(n - 1);
            for i in (k + 1)..=imax {
                let l = at(&data, i, k) / piv;
                data[k * width + (i + mu - k)] = l;
                let jmax = (k + mu).min(n - 1);
                for j in (k + 1)..=jmax {
                    let v = at(&data, k, j);
                    data[j * width + (i + mu - j)] -= l * v;
                }
            }
        }
        true
    }

    /// Solve `LU x = b` in place after [`BandMatrix::factor`].
    pub fn backsolve(&self, b: &mut [f64]) {
        let n = self.cell.n;
        let mu = self.cell.mupper;
        let ml = self.cell.mlower;
        let data = self.cell.data.borrow();
        let width = mu + ml + 1;
        let at = |i: usize, j: usize| data[j * width + (i + mu - j)];
        // forward: L has unit diagonal
        for k in 0..n {
            let imax = (k + ml).min(n - 1);
            for i in (k + 1)..=imax {
                b[i] -= at(i, k) * b[k];
            }
        }
        // backward
        for k in (0..n).rev() {
            b[k] /= at(k, k);
            let jmin = k.saturating_sub(mu);
            for i in jmin..k {
                b[i] -= at(i, k) * b[k];
            }
        }
    }

    #[must_use]
    pub fn view(&self) -> BandMatrixView {
        BandMatrixView {
            cell: Rc::clone(&self.cell),
            wrapped_at: self.cell.epoch.get(),
        }
    }

    pub fn relinquish(&self) {
        self.cell.epoch.set(self.cell.epoch.get().wrapping_add(1));
    }
}

/// Callback-scoped accessor over a [`BandMatrix`].
#[derive(Debug)]
pub struct BandMatrixView {
    cell: Rc<BandCell>,
    wrapped_at: u64,
}

impl BandMatrixView {
    fn check(&self) {
        assert!(
            self.cell.epoch.get() == self.wrapped_at,
            "matrix view used after its callback returned"
        );
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.check();
        self.cell.n
    }

    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.check();
        assert!(i < self.cell.n, "BandMatrix.get: invalid i");
        assert!(j < self.cell.n, "BandMatrix.get: invalid j");
        match self.cell.idx(i, j) {
            Some(k) => self.cell.data.borrow()[k],
            None => 0.0,
        }
    }

    pub fn set(&self, i: usize, j: usize, v: f64) {
        self.check();
        assert!(i < self.cell.n, "BandMatrix.set: invalid i");
        assert!(j < self.cell.n, "BandMatrix.set: invalid j");
        let k = self
            .cell
            .idx(i, j)
            .expect("BandMatrix.set: element outside the band");
        self.cell.data.borrow_mut()[k] = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_dense_get_set_roundtrip() {
        let a = DenseMatrix::new(2, 3);
        a.set(1, 2, 5.0);
        assert_eq!(a.get(1, 2), 5.0);
        assert_eq!(a.get(0, 0), 0.0);
        a.set_to_zero();
        assert_eq!(a.get(1, 2), 0.0);
    }

    #[test]
    #[should_panic(expected = "invalid i")]
    fn test_matrix_dense_get_out_of_range() {
        let a = DenseMatrix::new(2, 2);
        let _ = a.get(2, 0);
    }

    #[test]
    #[should_panic(expected = "used after its callback returned")]
    fn test_matrix_dense_view_invalidated() {
        let a = DenseMatrix::new(2, 2);
        let v = a.view();
        a.relinquish();
        let _ = v.get(0, 0);
    }

    #[test]
    fn test_matrix_band_addressing() {
        let a = BandMatrix::new(4, 1, 1);
        a.set(0, 0, 2.0);
        a.set(1, 0, -1.0);
        a.set(0, 1, -1.0);
        assert_eq!(a.get(0, 0), 2.0);
        assert_eq!(a.get(1, 0), -1.0);
        // outside the band reads as zero
        assert_eq!(a.get(3, 0), 0.0);
    }

    #[test]
    fn test_matrix_band_factor_solve_tridiagonal() {
        // -u'' discretization: tridiag(-1, 2, -1), solve against known rhs
        let n = 5;
        let a = BandMatrix::new(n, 1, 1);
        for j in 0..n {
            a.set(j, j, 2.0);
            if j > 0 {
                a.set(j, j - 1, -1.0);
                a.set(j - 1, j, -1.0);
            }
        }
        let x_true = [1.0, -2.0, 3.0, 0.5, -1.5];
        let mut b = vec![0.0; n];
        for i in 0..n {
            for j in 0..n {
                b[i] += a.get(i, j) * x_true[j];
            }
        }
        assert!(a.factor());
        a.backsolve(&mut b);
        for (got, want) in b.iter().zip(x_true.iter()) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_matrix_band_zero_pivot_reported() {
        let a = BandMatrix::new(2, 0, 0);
        // diagonal matrix with a zero pivot
        a.set(0, 0, 0.0);
        a.set(1, 1, 1.0);
        assert!(!a.factor());
    }
}
