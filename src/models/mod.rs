pub mod condition;
pub mod preview;
pub mod route;
pub mod rule_config;
pub mod statement;
