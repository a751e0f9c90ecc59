pub mod anthropic;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod github;
pub mod judgment;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod rate_limit;
pub mod recommender;
pub mod report;
pub mod retry;
pub mod state_machine;
pub mod ui;
