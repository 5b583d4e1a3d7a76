//! Linear algebra type system for the estimator
//!
//! All filter quantities are dynamically sized because the composed state and
//! the stacked observation only get their dimensions at assembly time. Buffers
//! are reshaped in place so that a steady-state tick does not allocate.

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, DVector, DVectorView, DVectorViewMut};

// ===== Owned Buffers =====
pub type Mat = DMatrix<f64>;
pub type Vector = DVector<f64>;

// ===== Views Into Owned Buffers =====
pub type MatView<'a> = DMatrixView<'a, f64>;
pub type MatViewMut<'a> = DMatrixViewMut<'a, f64>;
pub type VectorView<'a> = DVectorView<'a, f64>;
pub type VectorViewMut<'a> = DVectorViewMut<'a, f64>;

/// An empty `0×0` matrix, used as the initial value of every buffer.
pub fn empty_mat() -> Mat {
    Mat::zeros(0, 0)
}

/// An empty vector, used as the initial value of every buffer.
pub fn empty_vector() -> Vector {
    Vector::zeros(0)
}

/// Reshapes `matrix` to `rows×cols`. Contents are unspecified afterwards.
///
/// The backing storage is kept when the shape already matches and is resized
/// (not replaced) otherwise.
#[inline]
pub fn reshape(matrix: &mut Mat, rows: usize, cols: usize) {
    if matrix.shape() != (rows, cols) {
        matrix.resize_mut(rows, cols, 0.0);
    }
}

/// Reshapes `vector` to `rows` entries. Contents are unspecified afterwards.
#[inline]
pub fn reshape_vector(vector: &mut Vector, rows: usize) {
    if vector.nrows() != rows {
        vector.resize_vertically_mut(rows, 0.0);
    }
}

/// Reshapes `matrix` to `rows×cols` and fills it with zeros.
pub fn set_zero(matrix: &mut Mat, rows: usize, cols: usize) {
    reshape(matrix, rows, cols);
    matrix.fill(0.0);
}

/// Sets the provided matrix to a square identity matrix of the given size.
pub fn set_identity(matrix: &mut Mat, size: usize) {
    reshape(matrix, size, size);
    matrix.fill_with_identity();
}

/// Mutable view covering the whole matrix.
#[inline]
pub fn full_view_mut(matrix: &mut Mat) -> MatViewMut<'_> {
    let shape = matrix.shape();
    matrix.view_mut((0, 0), shape)
}

/// View covering the whole vector.
#[inline]
pub fn vector_view(vector: &Vector) -> VectorView<'_> {
    vector.rows(0, vector.nrows())
}

/// Mutable view covering the whole vector.
#[inline]
pub fn vector_view_mut(vector: &mut Vector) -> VectorViewMut<'_> {
    let rows = vector.nrows();
    vector.rows_mut(0, rows)
}
