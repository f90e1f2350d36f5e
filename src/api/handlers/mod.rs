pub mod preview;
pub mod rules;

use std::sync::Arc;

use crate::config::Config;
use crate::services::kernel::{KernelProps, ShardingKernel};
use crate::services::rule::RuleModelHolder;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub rules: Arc<RuleModelHolder>,
    pub config: Config,
}

impl AppState {
    pub fn new(rules: Arc<RuleModelHolder>, config: Config) -> Self {
        Self { rules, config }
    }

    /// Kernel bound to the current rule model snapshot
    pub fn kernel(&self) -> ShardingKernel {
        ShardingKernel::new(
            self.rules.snapshot(),
            KernelProps {
                sql_show: self.config.kernel.sql_show,
            },
        )
    }
}
