//! Daemon configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/voicesat/config.toml` by default. Every section is optional.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:6053"
//! name = "Living Room"
//!
//! [voice]
//! wakeup_sound = "/usr/share/sounds/voicesat/wake.flac"
//! active_wake_words = ["okay_nabu"]
//!
//! [audio]
//! capture_command = ["arecord", "-q", "-r", "16000", "-c", "1", "-f", "S16_LE", "-t", "raw"]
//! player_command = ["mpv", "--no-video", "--really-quiet", "--volume={volume}"]
//!
//! [[entities]]
//! kind = "switch"
//! object_id = "mute"
//! name = "Mute"
//! role = "mute"
//!
//! [[wake_words]]
//! id = "okay_nabu"
//! phrase = "Okay Nabu"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voicesat_server::{
    DEFAULT_PORT, EntityRegistry, MediaPlayerEntity, ServerConfig, SwitchEntity, SwitchRole,
    TextEntity, TextSource, VoiceTimings, WakeWordInfo,
};

use crate::cli::Cli;
use crate::error::{DaemonError, DaemonResult};

/// Configuration for the voicesat daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Device API settings.
    pub server: ServerSettings,

    /// Voice session settings.
    pub voice: VoiceSettings,

    /// Capture and playback commands.
    pub audio: AudioSettings,

    /// Entities exposed to the hub. Empty means the default set.
    pub entities: Vec<EntitySettings>,

    /// Wake word catalogue. Empty means the built-in one.
    pub wake_words: Vec<WakeWordSettings>,
}

/// Device API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub name: String,
    pub friendly_name: Option<String>,
    /// Overrides interface discovery; `FIXED_MAC_ADDRESS` still wins.
    pub mac_address: Option<String>,
    pub password: Option<String>,
    pub max_connections: usize,
    /// Seconds between server pings.
    pub ping_interval: u64,
    /// Seconds of silence before a connection is dropped.
    pub keepalive_timeout: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            name: defaults.name,
            friendly_name: None,
            mac_address: None,
            password: None,
            max_connections: defaults.max_connections,
            ping_interval: defaults.ping_interval.as_secs(),
            keepalive_timeout: defaults.keepalive_timeout.as_secs(),
        }
    }
}

/// Voice session settings. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VoiceSettings {
    pub refractory_window: f64,
    pub start_timeout: f64,
    pub max_listen_duration: f64,
    pub response_timeout: f64,
    /// Chime played when a wake signal is accepted.
    pub wakeup_sound: Option<String>,
    /// Sound looped while a timer rings.
    pub timer_finished_sound: Option<String>,
    /// Wake words active at startup. Empty means the first of the catalogue.
    pub active_wake_words: Vec<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        let timings = VoiceTimings::default();
        Self {
            refractory_window: timings.refractory_window.as_secs_f64(),
            start_timeout: timings.start_timeout.as_secs_f64(),
            max_listen_duration: timings.max_listen_duration.as_secs_f64(),
            response_timeout: timings.response_timeout.as_secs_f64(),
            wakeup_sound: None,
            timer_finished_sound: None,
            active_wake_words: Vec::new(),
        }
    }
}

/// Capture and playback commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioSettings {
    /// Command writing raw 16 kHz mono 16-bit PCM to stdout. Without it the
    /// satellite only wakes on SIGUSR1 and streams no audio.
    pub capture_command: Option<Vec<String>>,

    /// Player for music. Media locators are appended; `{volume}` in an
    /// argument is replaced by the volume in percent.
    pub player_command: Vec<String>,

    /// Player for responses, announcements and chimes. Defaults to
    /// `player_command`.
    pub announcer_command: Option<Vec<String>>,

    /// Volume in percent that ducked music is lowered to.
    pub duck_volume: u8,

    /// Captured frames buffered before the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            capture_command: None,
            player_command: vec![
                "mpv".to_string(),
                "--no-video".to_string(),
                "--really-quiet".to_string(),
                "--volume={volume}".to_string(),
            ],
            announcer_command: None,
            duck_volume: 20,
            queue_capacity: ServerConfig::default().audio_queue_capacity,
        }
    }
}

/// An entity exposed to the hub. Keys follow declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitySettings {
    MediaPlayer {
        object_id: String,
        name: String,
    },
    Switch {
        object_id: String,
        name: String,
        /// `plain` (default) or `mute`.
        #[serde(default)]
        role: Option<String>,
    },
    Text {
        object_id: String,
        name: String,
        /// `transcript`, `response` or `phase`.
        #[serde(default)]
        source: Option<String>,
    },
}

/// A wake word the detector can report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WakeWordSettings {
    pub id: String,
    pub phrase: String,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

impl DaemonConfig {
    /// Loads configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> DaemonResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> DaemonResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| DaemonError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| DaemonError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicesat")
            .join("config.toml")
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = cli.bind {
            self.server.bind = bind;
        }
        if let Some(ref name) = cli.name {
            self.server.name = name.clone();
        }
        if let Some(ref password) = cli.password {
            self.server.password = Some(password.clone());
        }
    }

    /// Builds the server configuration, validating values along the way.
    pub fn server_config(&self) -> DaemonResult<ServerConfig> {
        let server = &self.server;
        if server.name.trim().is_empty() {
            return Err(DaemonError::config("server.name must not be empty"));
        }
        if server.max_connections == 0 {
            return Err(DaemonError::config("server.max_connections must be at least 1"));
        }
        if server.ping_interval == 0 || server.keepalive_timeout <= server.ping_interval {
            return Err(DaemonError::config(
                "server.keepalive_timeout must be longer than a non-zero server.ping_interval",
            ));
        }
        if self.audio.queue_capacity == 0 {
            return Err(DaemonError::config("audio.queue_capacity must be at least 1"));
        }

        let timings = VoiceTimings {
            refractory_window: seconds("voice.refractory_window", self.voice.refractory_window)?,
            start_timeout: seconds("voice.start_timeout", self.voice.start_timeout)?,
            max_listen_duration: seconds(
                "voice.max_listen_duration",
                self.voice.max_listen_duration,
            )?,
            response_timeout: seconds("voice.response_timeout", self.voice.response_timeout)?,
        };

        let mut config = ServerConfig::new(server.bind)
            .with_name(server.name.clone())
            .with_max_connections(server.max_connections)
            .with_keepalive(
                Duration::from_secs(server.ping_interval),
                Duration::from_secs(server.keepalive_timeout),
            )
            .with_voice_timings(timings)
            .with_audio_queue_capacity(self.audio.queue_capacity);

        if let Some(ref friendly) = server.friendly_name {
            config = config.with_friendly_name(friendly.clone());
        }
        if let Some(ref mac) = server.mac_address {
            config = config.with_mac_address(mac.clone());
        }
        if let Some(ref password) = server.password {
            config = config.with_password(password.clone());
        }
        if let Some(ref sound) = self.voice.wakeup_sound {
            config = config.with_wakeup_sound(sound.clone());
        }
        if let Some(ref sound) = self.voice.timer_finished_sound {
            config = config.with_timer_finished_sound(sound.clone());
        }

        if !self.wake_words.is_empty() {
            let catalogue: Vec<WakeWordInfo> = self
                .wake_words
                .iter()
                .map(|ww| {
                    WakeWordInfo::new(ww.id.clone(), ww.phrase.clone())
                        .with_languages(ww.languages.clone())
                })
                .collect();
            let first = catalogue.iter().take(1).map(|ww| ww.id.clone()).collect();
            config = config.with_wake_words(catalogue, first);
        }
        if !self.voice.active_wake_words.is_empty() {
            let active = config.filter_active_wake_words(&self.voice.active_wake_words);
            if active.is_empty() {
                return Err(DaemonError::config(
                    "voice.active_wake_words names no known wake word",
                ));
            }
            let catalogue = config.wake_words.clone();
            config = config.with_wake_words(catalogue, active);
        }

        Ok(config)
    }

    /// Builds the entity registry. Without `[[entities]]` the satellite
    /// exposes a media player and a mute switch.
    pub fn entity_registry(&self) -> DaemonResult<EntityRegistry> {
        let defaults;
        let entities = if self.entities.is_empty() {
            defaults = default_entities();
            &defaults
        } else {
            &self.entities
        };

        let mut registry = EntityRegistry::new();
        let mut has_media_player = false;
        for entity in entities {
            let key = registry.next_key();
            match entity {
                EntitySettings::MediaPlayer { object_id, name } => {
                    if has_media_player {
                        return Err(DaemonError::config("only one media_player entity is supported"));
                    }
                    has_media_player = true;
                    registry.register(Box::new(MediaPlayerEntity::new(key, object_id, name)));
                }
                EntitySettings::Switch {
                    object_id,
                    name,
                    role,
                } => {
                    let role = match role.as_deref() {
                        None | Some("plain") => SwitchRole::Plain,
                        Some("mute") => SwitchRole::Mute,
                        Some(other) => {
                            return Err(DaemonError::config(format!(
                                "unknown switch role {other:?} for {object_id}"
                            )));
                        }
                    };
                    registry.register(Box::new(
                        SwitchEntity::new(key, object_id, name).with_role(role),
                    ));
                }
                EntitySettings::Text {
                    object_id,
                    name,
                    source,
                } => {
                    let mut text = TextEntity::new(key, object_id, name);
                    if let Some(source) = source {
                        let source = TextSource::from_name(source).ok_or_else(|| {
                            DaemonError::config(format!(
                                "unknown text source {source:?} for {object_id}"
                            ))
                        })?;
                        text = text.with_source(source);
                    }
                    registry.register(Box::new(text));
                }
            }
        }
        Ok(registry)
    }

    /// Command used for the announcer output.
    pub fn announcer_command(&self) -> &[String] {
        self.audio
            .announcer_command
            .as_deref()
            .unwrap_or(&self.audio.player_command)
    }
}

fn default_entities() -> Vec<EntitySettings> {
    vec![
        EntitySettings::MediaPlayer {
            object_id: "media_player".to_string(),
            name: "Media Player".to_string(),
        },
        EntitySettings::Switch {
            object_id: "mute".to_string(),
            name: "Mute".to_string(),
            role: Some("mute".to_string()),
        },
    ]
}

fn seconds(field: &str, value: f64) -> DaemonResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| DaemonError::config(format!("{field} must be a non-negative number of seconds")))
}
