//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// voicesat - voice satellite speaking the device API
#[derive(Debug, Parser)]
#[command(name = "voicesat")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "VOICESAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides [server] bind
    #[arg(long, env = "VOICESAT_BIND")]
    pub bind: Option<SocketAddr>,

    /// Device name, overrides [server] name
    #[arg(long, env = "VOICESAT_NAME")]
    pub name: Option<String>,

    /// API password, overrides [server] password
    #[arg(long, env = "VOICESAT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Log one JSON object per line
    #[arg(long, conflicts_with = "debug")]
    pub json_logs: bool,
}
