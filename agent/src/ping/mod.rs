//! Ping protocol with the deploy service

pub mod client;
pub mod host_info;
