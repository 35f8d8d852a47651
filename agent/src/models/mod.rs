//! Data models

pub mod deploy_status;
pub mod goal;
pub mod ping;
pub mod report;
pub mod status;
