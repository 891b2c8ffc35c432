pub mod adapters;
pub mod aggregate;
pub mod backwalk;
pub mod cli;
pub mod config;
pub mod delegation;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hosts;
pub mod metrics;
pub mod probe;
pub mod server_name;
pub mod targets;
pub mod telemetry;
