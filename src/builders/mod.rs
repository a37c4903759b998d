pub mod manager_builder;

pub use manager_builder::{build_worker_pool, JobManagerBuilder};
