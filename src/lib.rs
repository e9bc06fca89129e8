//! # emf
//!
//! Distributed matrix factorization of a ratings matrix by ALS or SGD.
//!
//! A [`Lord`](lord/struct.Lord.html) owns the ratings, the factor matrices
//! and the training loop. Every step of the loop is cut into portions that
//! local worker threads and the workers of connected
//! [`Chief`](chief/struct.Chief.html)s claim and compute. A portion whose
//! owner disappears is handed to someone else.

pub mod chief;
pub mod config;
pub mod error;
pub mod factors;
pub mod kernel;
pub mod lord;
pub mod network;
pub mod portion;
pub mod stats;
pub mod store;
pub mod worker;

pub use chief::Chief;
pub use config::{Algorithm, Precision, TrainingOptions};
pub use error::{EmfError, Result};
pub use kernel::{Kernel, NativeKernel};
pub use lord::{Lord, LordHandle, Status};
pub use store::MemoryRatingStore;
pub use store::{CalcInfo, Rating, RatingStore};
