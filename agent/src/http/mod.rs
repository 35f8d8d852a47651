//! HTTP transport to the deploy service

pub mod client;
