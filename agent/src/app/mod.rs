//! Agent application

pub mod instance;
pub mod options;
pub mod run;
