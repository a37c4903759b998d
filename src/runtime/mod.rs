//! Runtime adapters and API surface.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_pool;

pub use api::{health, Health, JobSnapshot};
#[cfg(feature = "tokio-runtime")]
pub use tokio_pool::TokioWorkerPool;
