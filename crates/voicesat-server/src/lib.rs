//! Satellite server: device API, voice session, timers, entities.
//!
//! This crate provides the satellite side of the device API:
//! - TCP listener and per-connection handshake gate
//! - Entity registry (media player, text attributes, switches)
//! - Voice session state machine and timer registry
//! - Audio ingress bridge from a blocking capture thread
//!
//! # Example
//!
//! ```rust,no_run
//! use voicesat_server::{
//!     DeviceIdentity, EntityRegistry, Players, Satellite, ServerConfig, SignalHandler, TcpServer,
//! };
//!
//! # fn players() -> Players { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let satellite = Satellite::new(config.clone(), EntityRegistry::new(), players());
//!     let handle = satellite.handle();
//!     tokio::spawn(satellite.run());
//!
//!     let signals = SignalHandler::new();
//!     let identity = DeviceIdentity::from_config(&config);
//!     let server = TcpServer::bind(config, identity).await?;
//!     server.run_until_shutdown(handle, signals.shutdown_handle()).await?;
//!     Ok(())
//! }
//! ```

mod audio;
mod collaborators;
mod config;
mod connection;
mod device;
mod entity;
mod error;
mod satellite;
mod signals;
mod socket;
mod timers;
mod voice;

pub use audio::{AudioConsumer, AudioProducer, CaptureThread, audio_channel};
pub use collaborators::{
    Indicator, IndicatorState, LogIndicator, PlaybackDone, PlaybackId, PlaybackPurpose,
    PlaybackTracker, Player, Players, WakeDetection, WakeDetector,
};
pub use config::{DEFAULT_PORT, MAX_ACTIVE_WAKE_WORDS, ServerConfig, WakeWordInfo};
pub use connection::{
    CloseReason, ConnectionContext, GateDecision, GateState, ProtocolGate, serve_connection,
};
pub use device::{DeviceIdentity, FIXED_MAC_ENV, device_name, resolve_mac};
pub use entity::{
    CommandError, Entity, EntityContext, EntityRegistry, MediaPlayerEntity, SwitchEntity,
    SwitchRole, TextEntity, TextSource, announcement_url, command_key,
};
pub use error::{ServerError, ServerResult};
pub use satellite::{
    ConnectionId, Satellite, SatelliteCommand, SatelliteHandle, SatelliteStatus,
};
pub use signals::{ShutdownHandle, ShutdownSignal, Signal, SignalHandler};
pub use socket::{Accepted, TcpServer};
pub use timers::{Timer, TimerChange, TimerRegistry};
pub use voice::{
    MAX_RESPONSE_PLAYBACK, SessionEnd, SessionState, VoiceAction, VoiceSession, VoiceTimings,
    WakeRejected,
};
