//! deployd library
//!
//! Core modules for the host deploy agent.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod models;
pub mod ping;
pub mod storage;
pub mod telemetry;
pub mod utils;
