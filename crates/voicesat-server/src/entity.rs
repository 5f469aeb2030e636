//! Entities exposed to the hub: media player, text attributes, switches.
//!
//! Each entity knows how to describe itself, report its state and react
//! to the commands addressed to its key. The registry owns them and keeps
//! them in key order so the listing is stable across connections.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use voicesat_core::clamp_unit;
use voicesat_protocol::{
    EntityCategory, ListEntitiesMediaPlayerResponse, ListEntitiesSwitchResponse,
    ListEntitiesTextSensorResponse, MediaPlayerCommand, MediaPlayerCommandRequest,
    MediaPlayerState, MediaPlayerStateResponse, Message, SwitchCommandRequest,
    SwitchStateResponse, TextSensorStateResponse,
};

use crate::collaborators::{PlaybackPurpose, PlaybackTracker, Players};

/// A command that could not be applied. Logged and otherwise ignored.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// No entity has this key.
    #[error("no entity with key {0}")]
    UnknownKey(u32),

    /// The entity does not accept this kind of command.
    #[error("{object_id} does not accept {command}")]
    Unsupported {
        object_id: String,
        command: &'static str,
    },

    /// The command is addressed correctly but makes no sense.
    #[error("malformed command for {object_id}: {reason}")]
    Malformed { object_id: String, reason: String },
}

/// Pipeline values a text entity can mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextSource {
    /// Recognised speech of the last run.
    Transcript,
    /// Text of the last response.
    Response,
    /// Current voice session state.
    Phase,
}

impl TextSource {
    /// Parses a configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "transcript" => Some(Self::Transcript),
            "response" => Some(Self::Response),
            "phase" => Some(Self::Phase),
            _ => None,
        }
    }
}

/// Roles a switch can be bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwitchRole {
    /// Plain on/off state kept for the hub.
    #[default]
    Plain,
    /// Microphone mute.
    Mute,
}

/// What entity commands may touch.
pub struct EntityContext<'a> {
    pub players: &'a mut Players,
    pub playbacks: &'a mut PlaybackTracker,
    /// Microphone mute flag.
    pub muted: &'a mut bool,
}

/// Something the hub can list, observe and command.
pub trait Entity: Send {
    /// Stable key, unique per satellite.
    fn key(&self) -> u32;

    /// Object id used in the hub's entity id.
    fn object_id(&self) -> &str;

    /// The list entities response for this entity.
    fn describe(&self) -> Message;

    /// The current state message.
    fn state_message(&self) -> Message;

    /// Applies a command addressed to this entity's key.
    fn handle_command(
        &mut self,
        command: &Message,
        ctx: &mut EntityContext<'_>,
    ) -> Result<(), CommandError>;

    /// Mirrors a pipeline value. Returns true if the state changed.
    fn publish(&mut self, _source: TextSource, _value: &str) -> bool {
        false
    }

    /// Typed access to the media player, if this is one.
    fn as_media_player(&mut self) -> Option<&mut MediaPlayerEntity> {
        None
    }
}

/// Returns the entity key a command message is addressed to.
pub fn command_key(message: &Message) -> Option<u32> {
    match message {
        Message::SwitchCommandRequest(cmd) => Some(cmd.key),
        Message::MediaPlayerCommandRequest(cmd) => Some(cmd.key),
        _ => None,
    }
}

/// Media url of a media player command that asks for an announcement.
pub fn announcement_url(message: &Message) -> Option<&str> {
    match message {
        Message::MediaPlayerCommandRequest(cmd)
            if cmd.has_media_url
                && cmd.has_announcement
                && cmd.announcement
                && !cmd.media_url.is_empty() =>
        {
            Some(&cmd.media_url)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Media player
// ---------------------------------------------------------------------------

/// The satellite's speaker, as seen by the hub.
///
/// Music plays on the music player. Announcements play on the announcer
/// and pause the music for their duration.
#[derive(Debug)]
pub struct MediaPlayerEntity {
    key: u32,
    object_id: String,
    name: String,
    state: MediaPlayerState,
    volume: f32,
    muted: bool,
    resume_after_announcement: bool,
    duck_holders: u32,
}

impl MediaPlayerEntity {
    /// Creates an idle media player at full volume.
    pub fn new(key: u32, object_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key,
            object_id: object_id.into(),
            name: name.into(),
            state: MediaPlayerState::Idle,
            volume: 1.0,
            muted: false,
            resume_after_announcement: false,
            duck_holders: 0,
        }
    }

    /// Current playback state.
    pub fn state(&self) -> MediaPlayerState {
        self.state
    }

    /// Current volume in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Returns true when output is muted.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Starts ambient media.
    pub fn play_media(&mut self, url: &str, ctx: &mut EntityContext<'_>) {
        info!(url, "Playing media");
        ctx.playbacks.cancel(PlaybackPurpose::Media);
        let done = ctx.playbacks.begin(PlaybackPurpose::Media);
        ctx.players.music.play(&[url.to_string()], done);
        self.state = MediaPlayerState::Playing;
    }

    /// Plays an announcement, pausing music until it is over.
    pub fn announce(&mut self, media: &[String], purpose: PlaybackPurpose, ctx: &mut EntityContext<'_>) {
        info!(?media, "Playing announcement");
        if ctx.players.music.is_playing() && self.state == MediaPlayerState::Playing {
            ctx.players.music.pause();
            self.resume_after_announcement = true;
        }
        ctx.playbacks.cancel(PlaybackPurpose::WakeSound);
        let done = ctx.playbacks.begin(purpose);
        ctx.players.announcer.play(media, done);
        self.state = MediaPlayerState::Playing;
    }

    /// Called when an announcement finished playing.
    pub fn announcement_finished(&mut self, players: &mut Players) {
        if std::mem::take(&mut self.resume_after_announcement) {
            debug!("Resuming music after announcement");
            players.music.resume();
            self.state = MediaPlayerState::Playing;
        } else {
            self.state = MediaPlayerState::Idle;
        }
    }

    /// Called when ambient media finished playing.
    pub fn media_finished(&mut self) {
        if !self.resume_after_announcement {
            self.state = MediaPlayerState::Idle;
        }
    }

    /// Lowers the music. Nested calls need matching [`Self::unduck`] calls.
    pub fn duck(&mut self, players: &mut Players) {
        self.duck_holders += 1;
        if self.duck_holders == 1 {
            debug!("Ducking music");
            players.music.duck();
        }
    }

    /// Releases one duck; the music comes back when none is left.
    pub fn unduck(&mut self, players: &mut Players) {
        match self.duck_holders {
            0 => {}
            1 => {
                self.duck_holders = 0;
                debug!("Unducking music");
                players.music.unduck();
            }
            _ => self.duck_holders -= 1,
        }
    }

    fn set_volume(&mut self, volume: f32, players: &mut Players) {
        self.volume = clamp_unit("volume", volume, self.volume);
        if !self.muted {
            players.music.set_volume(self.volume);
            players.announcer.set_volume(self.volume);
        }
    }

    fn run_command(&mut self, command: MediaPlayerCommand, ctx: &mut EntityContext<'_>) {
        match command {
            MediaPlayerCommand::Pause => {
                ctx.players.music.pause();
                ctx.players.announcer.pause();
                self.state = if ctx.players.music.is_playing() || ctx.players.announcer.is_playing() {
                    MediaPlayerState::Paused
                } else {
                    MediaPlayerState::Idle
                };
            }
            MediaPlayerCommand::Play => {
                ctx.players.music.resume();
                ctx.players.announcer.resume();
                self.state = if ctx.players.music.is_playing() || ctx.players.announcer.is_playing() {
                    MediaPlayerState::Playing
                } else {
                    MediaPlayerState::Idle
                };
            }
            MediaPlayerCommand::Stop => {
                ctx.playbacks.cancel(PlaybackPurpose::Media);
                ctx.players.music.stop();
                self.resume_after_announcement = false;
                self.state = MediaPlayerState::Idle;
            }
            MediaPlayerCommand::Mute => {
                if !self.muted {
                    self.muted = true;
                    ctx.players.music.set_volume(0.0);
                    ctx.players.announcer.set_volume(0.0);
                }
            }
            MediaPlayerCommand::Unmute => {
                if self.muted {
                    self.muted = false;
                    ctx.players.music.set_volume(self.volume);
                    ctx.players.announcer.set_volume(self.volume);
                }
            }
        }
    }
}

impl Entity for MediaPlayerEntity {
    fn key(&self) -> u32 {
        self.key
    }

    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn describe(&self) -> Message {
        ListEntitiesMediaPlayerResponse {
            object_id: self.object_id.clone(),
            key: self.key,
            name: self.name.clone(),
            unique_id: self.object_id.clone(),
            supports_pause: true,
            ..Default::default()
        }
        .into()
    }

    fn state_message(&self) -> Message {
        MediaPlayerStateResponse {
            key: self.key,
            state: self.state as i32,
            volume: self.volume,
            muted: self.muted,
        }
        .into()
    }

    fn handle_command(
        &mut self,
        command: &Message,
        ctx: &mut EntityContext<'_>,
    ) -> Result<(), CommandError> {
        let Message::MediaPlayerCommandRequest(cmd) = command else {
            return Err(CommandError::Unsupported {
                object_id: self.object_id.clone(),
                command: command.name(),
            });
        };
        self.apply(cmd, ctx)
    }

    fn as_media_player(&mut self) -> Option<&mut MediaPlayerEntity> {
        Some(self)
    }
}

impl MediaPlayerEntity {
    fn apply(
        &mut self,
        cmd: &MediaPlayerCommandRequest,
        ctx: &mut EntityContext<'_>,
    ) -> Result<(), CommandError> {
        if cmd.has_media_url {
            if cmd.media_url.is_empty() {
                return Err(CommandError::Malformed {
                    object_id: self.object_id.clone(),
                    reason: "empty media url".to_string(),
                });
            }
            if cmd.has_announcement && cmd.announcement {
                let purpose = PlaybackPurpose::Announcement {
                    notify_peer: false,
                    start_conversation: false,
                };
                self.announce(&[cmd.media_url.clone()], purpose, ctx);
            } else {
                self.play_media(&cmd.media_url, ctx);
            }
            return Ok(());
        }

        if cmd.has_command {
            let command = MediaPlayerCommand::try_from(cmd.command).map_err(|_| {
                CommandError::Malformed {
                    object_id: self.object_id.clone(),
                    reason: format!("unknown media player command {}", cmd.command),
                }
            })?;
            debug!(?command, "Media player command");
            self.run_command(command, ctx);
            return Ok(());
        }

        if cmd.has_volume {
            self.set_volume(cmd.volume, ctx.players);
            return Ok(());
        }

        Err(CommandError::Malformed {
            object_id: self.object_id.clone(),
            reason: "no command, volume or media url".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Text attribute
// ---------------------------------------------------------------------------

/// A read-only text value, optionally mirroring a pipeline value.
#[derive(Debug)]
pub struct TextEntity {
    key: u32,
    object_id: String,
    name: String,
    source: Option<TextSource>,
    value: String,
}

impl TextEntity {
    pub fn new(key: u32, object_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key,
            object_id: object_id.into(),
            name: name.into(),
            source: None,
            value: String::new(),
        }
    }

    /// Builder: mirror a pipeline value.
    pub fn with_source(mut self, source: TextSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Entity for TextEntity {
    fn key(&self) -> u32 {
        self.key
    }

    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn describe(&self) -> Message {
        ListEntitiesTextSensorResponse {
            object_id: self.object_id.clone(),
            key: self.key,
            name: self.name.clone(),
            unique_id: self.object_id.clone(),
            entity_category: EntityCategory::Diagnostic as i32,
            ..Default::default()
        }
        .into()
    }

    fn state_message(&self) -> Message {
        TextSensorStateResponse {
            key: self.key,
            state: self.value.clone(),
            missing_state: false,
        }
        .into()
    }

    fn handle_command(
        &mut self,
        command: &Message,
        _ctx: &mut EntityContext<'_>,
    ) -> Result<(), CommandError> {
        Err(CommandError::Unsupported {
            object_id: self.object_id.clone(),
            command: command.name(),
        })
    }

    fn publish(&mut self, source: TextSource, value: &str) -> bool {
        if self.source != Some(source) || self.value == value {
            return false;
        }
        self.value = value.to_string();
        true
    }
}

// ---------------------------------------------------------------------------
// Switch
// ---------------------------------------------------------------------------

/// An on/off switch.
#[derive(Debug)]
pub struct SwitchEntity {
    key: u32,
    object_id: String,
    name: String,
    role: SwitchRole,
    state: bool,
}

impl SwitchEntity {
    pub fn new(key: u32, object_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key,
            object_id: object_id.into(),
            name: name.into(),
            role: SwitchRole::Plain,
            state: false,
        }
    }

    /// Builder: bind to a role.
    pub fn with_role(mut self, role: SwitchRole) -> Self {
        self.role = role;
        self
    }

    pub fn state(&self) -> bool {
        self.state
    }
}

impl Entity for SwitchEntity {
    fn key(&self) -> u32 {
        self.key
    }

    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn describe(&self) -> Message {
        let (icon, category) = match self.role {
            SwitchRole::Mute => ("mdi:microphone-off", EntityCategory::Config),
            SwitchRole::Plain => ("", EntityCategory::None),
        };
        ListEntitiesSwitchResponse {
            object_id: self.object_id.clone(),
            key: self.key,
            name: self.name.clone(),
            unique_id: self.object_id.clone(),
            icon: icon.to_string(),
            entity_category: category as i32,
            ..Default::default()
        }
        .into()
    }

    fn state_message(&self) -> Message {
        SwitchStateResponse {
            key: self.key,
            state: self.state,
        }
        .into()
    }

    fn handle_command(
        &mut self,
        command: &Message,
        ctx: &mut EntityContext<'_>,
    ) -> Result<(), CommandError> {
        let Message::SwitchCommandRequest(SwitchCommandRequest { state, .. }) = command else {
            return Err(CommandError::Unsupported {
                object_id: self.object_id.clone(),
                command: command.name(),
            });
        };
        self.state = *state;
        if self.role == SwitchRole::Mute {
            info!(muted = self.state, "Microphone mute changed");
            *ctx.muted = self.state;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All entities of this satellite, keyed and ordered by key.
#[derive(Default)]
pub struct EntityRegistry {
    entities: BTreeMap<u32, Box<dyn Entity>>,
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entities.iter().map(|(k, e)| (k, e.object_id())))
            .finish()
    }
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity. A second entity with the same key is ignored
    /// and `false` is returned.
    pub fn register(&mut self, entity: Box<dyn Entity>) -> bool {
        let key = entity.key();
        if let Some(existing) = self.entities.get(&key) {
            warn!(
                key,
                existing = existing.object_id(),
                ignored = entity.object_id(),
                "Entity key already registered"
            );
            return false;
        }
        self.entities.insert(key, entity);
        true
    }

    /// Next unused key (one past the highest).
    pub fn next_key(&self) -> u32 {
        self.entities.keys().next_back().map_or(0, |k| k + 1)
    }

    /// List entities responses, in key order.
    pub fn list(&self) -> Vec<Message> {
        self.entities.values().map(|e| e.describe()).collect()
    }

    /// Current state of every entity, in key order.
    pub fn states(&self) -> Vec<Message> {
        self.entities.values().map(|e| e.state_message()).collect()
    }

    /// Routes a command to its entity and returns the entity's new state.
    pub fn dispatch_command(
        &mut self,
        command: &Message,
        ctx: &mut EntityContext<'_>,
    ) -> Result<Message, CommandError> {
        let Some(key) = command_key(command) else {
            return Err(CommandError::Unsupported {
                object_id: String::new(),
                command: command.name(),
            });
        };
        let entity = self
            .entities
            .get_mut(&key)
            .ok_or(CommandError::UnknownKey(key))?;
        entity.handle_command(command, ctx)?;
        Ok(entity.state_message())
    }

    /// Mirrors a pipeline value into the entities bound to `source` and
    /// returns the states that changed.
    pub fn publish(&mut self, source: TextSource, value: &str) -> Vec<Message> {
        self.entities
            .values_mut()
            .filter_map(|e| e.publish(source, value).then(|| e.state_message()))
            .collect()
    }

    /// The first media player, if any.
    pub fn media_player(&mut self) -> Option<&mut MediaPlayerEntity> {
        self.entities.values_mut().find_map(|e| e.as_media_player())
    }

    /// State message of one entity.
    pub fn state_of(&self, key: u32) -> Option<Message> {
        self.entities.get(&key).map(|e| e.state_message())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
