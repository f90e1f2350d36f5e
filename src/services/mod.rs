pub mod algorithm;
pub mod condition;
pub mod inline_expr;
pub mod kernel; // Bind, route and rewrite pipeline
pub mod rewrite;
pub mod route;
pub mod rule;
