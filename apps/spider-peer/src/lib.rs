pub mod cli;
pub mod config;
pub mod media;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;
