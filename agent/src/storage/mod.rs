pub mod config;
pub mod env_status;
pub mod layout;
pub mod settings;
