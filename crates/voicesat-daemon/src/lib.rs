//! CLI, configuration file, process-backed audio
//!
//! This crate provides the `voicesat` daemon.

pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod player;

pub use capture::CaptureProcess;
pub use cli::Cli;
pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use player::CommandPlayer;
