//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::voice::VoiceTimings;

/// Default device API port.
pub const DEFAULT_PORT: u16 = 6053;

/// Largest number of wake words the hub may activate at once.
pub const MAX_ACTIVE_WAKE_WORDS: usize = 2;

/// A wake word the satellite can listen for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeWordInfo {
    /// Stable identifier used by the hub.
    pub id: String,
    /// Spoken phrase, sent along with the pipeline start request.
    pub phrase: String,
    /// Languages the model was trained on.
    pub trained_languages: Vec<String>,
}

impl WakeWordInfo {
    /// Creates a wake word entry trained on English.
    pub fn new(id: impl Into<String>, phrase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phrase: phrase.into(),
            trained_languages: vec!["en".to_string()],
        }
    }

    /// Builder: set the trained languages.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.trained_languages = languages;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the device API listens on.
    pub bind: SocketAddr,

    /// Human readable device name; the advertised name is derived from it.
    pub name: String,

    /// Name shown in the hub UI. Defaults to `name`.
    pub friendly_name: Option<String>,

    /// Fixed MAC address, overrides interface discovery.
    pub mac_address: Option<String>,

    /// Password required in the connect request, if any.
    pub password: Option<String>,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Interval between server-initiated pings once authenticated.
    pub ping_interval: Duration,

    /// Silence after which a connection is considered gone.
    pub keepalive_timeout: Duration,

    /// Cooldown after an accepted wake signal.
    pub refractory_window: Duration,

    /// Time allowed for the hub to acknowledge a pipeline start.
    pub start_timeout: Duration,

    /// Longest audio stream before the satellite stops listening itself.
    pub max_listen_duration: Duration,

    /// Time allowed for the hub to produce a response once streaming stops.
    pub response_timeout: Duration,

    /// Captured frames buffered between the capture thread and the server.
    pub audio_queue_capacity: usize,

    /// Outbound messages buffered per connection.
    pub outbound_queue_capacity: usize,

    /// Wake words the satellite can detect.
    pub wake_words: Vec<WakeWordInfo>,

    /// Wake words active at startup.
    pub active_wake_words: Vec<String>,

    /// Chime played when a wake signal is accepted.
    pub wakeup_sound: Option<String>,

    /// Sound looped while a timer is ringing.
    pub timer_finished_sound: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let timings = VoiceTimings::default();
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            name: "Voice Satellite".to_string(),
            friendly_name: None,
            mac_address: None,
            password: None,
            max_connections: 8,
            ping_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(60),
            refractory_window: timings.refractory_window,
            start_timeout: timings.start_timeout,
            max_listen_duration: timings.max_listen_duration,
            response_timeout: timings.response_timeout,
            audio_queue_capacity: 64,
            outbound_queue_capacity: 256,
            wake_words: vec![WakeWordInfo::new("okay_nabu", "Okay Nabu")],
            active_wake_words: vec!["okay_nabu".to_string()],
            wakeup_sound: None,
            timer_finished_sound: None,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration listening on `bind`.
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    /// Builder: set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder: set the friendly name.
    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    /// Builder: pin the MAC address.
    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }

    /// Builder: require a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set keepalive parameters.
    pub fn with_keepalive(mut self, ping_interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.keepalive_timeout = timeout;
        self
    }

    /// Builder: set the voice session timings.
    pub fn with_voice_timings(mut self, timings: VoiceTimings) -> Self {
        self.refractory_window = timings.refractory_window;
        self.start_timeout = timings.start_timeout;
        self.max_listen_duration = timings.max_listen_duration;
        self.response_timeout = timings.response_timeout;
        self
    }

    /// Builder: set the audio queue capacity.
    pub fn with_audio_queue_capacity(mut self, capacity: usize) -> Self {
        self.audio_queue_capacity = capacity;
        self
    }

    /// Builder: replace the wake word catalogue and active set.
    pub fn with_wake_words(mut self, available: Vec<WakeWordInfo>, active: Vec<String>) -> Self {
        self.wake_words = available;
        self.active_wake_words = active;
        self
    }

    /// Builder: set the wake-up chime.
    pub fn with_wakeup_sound(mut self, sound: impl Into<String>) -> Self {
        self.wakeup_sound = Some(sound.into());
        self
    }

    /// Builder: set the timer alarm sound.
    pub fn with_timer_finished_sound(mut self, sound: impl Into<String>) -> Self {
        self.timer_finished_sound = Some(sound.into());
        self
    }

    /// Voice session timings.
    pub fn voice_timings(&self) -> VoiceTimings {
        VoiceTimings {
            refractory_window: self.refractory_window,
            start_timeout: self.start_timeout,
            max_listen_duration: self.max_listen_duration,
            response_timeout: self.response_timeout,
        }
    }

    /// Looks up a wake word by id.
    pub fn wake_word(&self, id: &str) -> Option<&WakeWordInfo> {
        self.wake_words.iter().find(|ww| ww.id == id)
    }

    /// Keeps only known ids, at most [`MAX_ACTIVE_WAKE_WORDS`], without duplicates.
    pub fn filter_active_wake_words<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        let mut active: Vec<String> = Vec::new();
        for id in ids {
            if active.len() == MAX_ACTIVE_WAKE_WORDS {
                break;
            }
            if self.wake_word(id).is_some() && !active.contains(id) {
                active.push(id.clone());
            }
        }
        active
    }
}
