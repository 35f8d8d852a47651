//! Deploy orchestration

pub mod agent;
pub mod context;
pub mod executor;
pub mod helper;
pub mod plan;
