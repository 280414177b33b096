//! Bridge between `ndarray` matrices and the `faer` dense solvers.
//!
//! The pipeline only decomposes small symmetric matrices (metric correlation
//! matrices and confound normal equations), so inputs are copied into an owned
//! `faer::Mat` and results copied back into `ndarray` containers.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn to_faer<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    let (rows, cols) = array.dim();
    Mat::from_fn(rows, cols, |i, j| array[(i, j)])
}

fn to_ndarray(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

pub trait FaerEigh {
    /// Eigenvalues in ascending order with the matching eigenvectors as columns.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let eigen = to_faer(self)
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let s = eigen.S().column_vector().as_mat();
        let values = Array1::from_shape_fn(s.nrows(), |i| s[(i, 0)]);
        Ok((values, to_ndarray(eigen.U())))
    }
}

/// Symmetric eigendecomposition with eigenpairs reordered from largest to smallest
/// eigenvalue. Scree sequences and factor extraction both consume this ordering.
pub fn eigh_descending(
    matrix: &Array2<f64>,
) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
    let (values, vectors) = matrix.eigh(Side::Lower)?;
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let sorted = order.iter().map(|&k| values[k]).collect();
    let mut columns = Array2::zeros(vectors.dim());
    for (dest, &k) in order.iter().enumerate() {
        columns.column_mut(dest).assign(&vectors.column(k));
    }
    Ok((sorted, columns))
}

/// Lower-triangular factor `L` of a symmetric positive definite matrix `A = L L'`.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let b = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let x = self.factor.solve(b.as_ref());
        Array1::from_shape_fn(rhs.len(), |i| x[(i, 0)])
    }

    /// Diagonal of `L`; ratios between entries expose near rank deficiency.
    pub fn diag(&self) -> Array1<f64> {
        let l = self.factor.L();
        Array1::from_shape_fn(l.nrows(), |i| l[(i, i)])
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let factor = to_faer(self)
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}
