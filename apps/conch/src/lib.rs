pub mod call;
pub mod cli;
pub mod config;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod telemetry;
