//! Multi-tenant LLM gateway: request routing and enforcement core.
//!
//! A request travels claims → pool enforcement → routing (capabilities,
//! health, budget, rate limits) → billing invariants → provider call →
//! tool loop → cost ledger. Every step fails closed.

pub mod arguments;
pub mod config;
pub mod domain;
pub mod infra;
pub mod pipeline;
pub mod run;
pub mod shutdown_controller;

pub use run::start;
