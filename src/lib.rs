pub mod api;
pub mod binder;
pub mod config;
pub mod models;
pub mod services;

pub use binder::bind;
pub use services::kernel::{ExecutionContext, KernelProps, ShardingKernel};
