pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod env;
pub mod grpo;
pub mod models;
pub mod plot;
pub mod telemetry;
