//! Integration tests for the deploy agent

mod fakes;
mod test_agent;
mod test_env_status;
