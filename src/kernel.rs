//! The numeric kernel: everything that happens inside a single portion.
//!
//! The coordinator treats a kernel as a pure function of its inputs. Running
//! the same portion twice against the same factors writes the same rows,
//! which is what makes recomputing a dropped portion safe.
use crate::config::SgdParams;
use crate::error::{EmfError, Result};
use crate::factors::{FactorMatrix, RowsMut};
use crate::store::Rating;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Partial RMSE sums of one portion, summed across portions
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct RmseSums {
    /// Sum of squared differences between actual and predicted ratings
    pub sum_diff2: f64,
    /// Sum of `actual - predicted`
    pub sum_diff: f64,
    pub count: usize,
}

impl RmseSums {
    pub fn add(&mut self, other: &RmseSums) {
        self.sum_diff2 += other.sum_diff2;
        self.sum_diff += other.sum_diff;
        self.count += other.count;
    }

    pub fn rmse(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_diff2 / self.count as f64).sqrt()
        }
    }

    /// Mean error, added to every prediction of a shifted pass
    pub fn avg_diff(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_diff / self.count as f64
        }
    }
}

pub trait Kernel: Send + Sync {
    /// Solves every row of `out` against the fixed `other` matrix.
    /// `ratings[i]` holds the `(column, value)` pairs of row
    /// `out.range().from + i`.
    fn als_rows(
        &self,
        out: &mut RowsMut<'_>,
        ratings: &[Vec<(usize, f32)>],
        other: &FactorMatrix,
        lambda: f64,
    ) -> Result<()>;

    /// One gradient step per rating, in order
    fn sgd(
        &self,
        ratings: &[Rating],
        users: &mut RowsMut<'_>,
        items: &mut RowsMut<'_>,
        params: &SgdParams,
    ) -> Result<()>;

    /// Sums of `actual - (predicted + shift)` over `ratings`
    fn rmse(
        &self,
        ratings: &[Rating],
        users: &FactorMatrix,
        items: &FactorMatrix,
        shift: f64,
    ) -> RmseSums;
}

/// Dense `nalgebra` kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeKernel;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

impl Kernel for NativeKernel {
    fn als_rows(
        &self,
        out: &mut RowsMut<'_>,
        ratings: &[Vec<(usize, f32)>],
        other: &FactorMatrix,
        lambda: f64,
    ) -> Result<()> {
        let range = out.range();
        if ratings.len() != range.len() {
            return Err(EmfError::RowOutOfRange);
        }
        let nd = out.factors();
        let mut col = vec![0.0; nd];
        for (row, cols) in range.iter().zip(ratings.iter()) {
            if cols.is_empty() {
                out.write_row(row, &vec![0.0; nd]);
                continue;
            }
            // (YᵀY + λnI) x = Yᵀr over the columns this row rated
            let mut mtm = DMatrix::<f64>::zeros(nd, nd);
            let mut v = DVector::<f64>::zeros(nd);
            for (c, value) in cols {
                other.read_row(*c, &mut col);
                let y = DVector::from_column_slice(&col);
                mtm += &y * y.transpose();
                v += &y * (*value as f64);
            }
            let reg = lambda * cols.len() as f64;
            for i in 0..nd {
                mtm[(i, i)] += reg;
            }
            let chol = mtm.cholesky().ok_or_else(|| {
                EmfError::Kernel(format!("row {} is not positive definite", row))
            })?;
            let soln = chol.solve(&v);
            out.write_row(row, soln.as_slice());
        }
        Ok(())
    }

    fn sgd(
        &self,
        ratings: &[Rating],
        users: &mut RowsMut<'_>,
        items: &mut RowsMut<'_>,
        params: &SgdParams,
    ) -> Result<()> {
        let nd = users.factors();
        let mut u = vec![0.0; nd];
        let mut i = vec![0.0; nd];
        let lr = params.learning_rate;
        for r in ratings {
            users.read_row(r.user, &mut u);
            items.read_row(r.item, &mut i);
            let err = r.value as f64 - dot(&u, &i);
            for k in 0..nd {
                let uk = u[k];
                u[k] += lr * (err * i[k] - params.lambda * uk);
                i[k] += lr * (err * uk - params.lambda * i[k]);
            }
            users.write_row(r.user, &u);
            items.write_row(r.item, &i);
        }
        Ok(())
    }

    fn rmse(
        &self,
        ratings: &[Rating],
        users: &FactorMatrix,
        items: &FactorMatrix,
        shift: f64,
    ) -> RmseSums {
        let nd = users.factors();
        let mut u = vec![0.0; nd];
        let mut i = vec![0.0; nd];
        let mut sums = RmseSums::default();
        for r in ratings {
            users.read_row(r.user, &mut u);
            items.read_row(r.item, &mut i);
            let diff = r.value as f64 - (dot(&u, &i) + shift);
            sums.sum_diff2 += diff * diff;
            sums.sum_diff += diff;
            sums.count += 1;
        }
        sums
    }
}
