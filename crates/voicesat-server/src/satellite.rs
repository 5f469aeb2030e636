//! The satellite event loop.
//!
//! One task owns the voice session, the entities, the timers and the
//! players. Connections, signal handlers and the daemon talk to it through
//! a [`SatelliteHandle`]; playback completions and captured audio arrive on
//! their own channels. Nothing here blocks, so a slow peer or a stuck
//! player never stalls the others.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use voicesat_core::AudioFrame;
use voicesat_protocol::{
    ListEntitiesDoneResponse, Message, VoiceAssistantAnnounceFinished,
    VoiceAssistantAnnounceRequest, VoiceAssistantAudio, VoiceAssistantConfigurationResponse,
    VoiceAssistantWakeWord,
};

use crate::audio::AudioConsumer;
use crate::collaborators::{
    Indicator, IndicatorState, LogIndicator, PlaybackId, PlaybackPurpose, PlaybackTracker,
    Players, WakeDetector,
};
use crate::config::{MAX_ACTIVE_WAKE_WORDS, ServerConfig};
use crate::entity::{Entity, EntityContext, EntityRegistry, announcement_url, command_key};
use crate::error::{ServerError, ServerResult};
use crate::timers::{Timer, TimerChange, TimerRegistry};
use crate::voice::{SessionEnd, SessionState, VoiceAction, VoiceSession, WakeRejected};

/// Identifies one peer connection.
pub type ConnectionId = u64;

/// Pause between two rounds of the timer alarm.
const ALARM_GAP: Duration = Duration::from_secs(1);

/// Commands accepted by the satellite task.
#[derive(Debug)]
pub enum SatelliteCommand {
    /// An authenticated connection wants state pushes.
    Attach {
        id: ConnectionId,
        outbound: mpsc::Sender<Message>,
    },
    /// A connection went away.
    Detach { id: ConnectionId },
    /// A message from an authenticated connection.
    Inbound { id: ConnectionId, message: Message },
    /// A wake signal from outside the audio path (signal, button).
    Wake { wake_word: Option<String> },
    /// Snapshot request.
    Status { reply: oneshot::Sender<SatelliteStatus> },
    /// Stop the event loop.
    Shutdown,
}

/// Snapshot of the satellite for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteStatus {
    pub session_state: SessionState,
    pub session_id: Option<u64>,
    pub voice_peer: Option<ConnectionId>,
    pub connections: usize,
    pub muted: bool,
    pub timers: Vec<Timer>,
    pub ringing: bool,
    pub active_wake_words: Vec<String>,
    pub dropped_audio_frames: u64,
}

/// Cloneable sender side of the satellite task.
#[derive(Debug, Clone)]
pub struct SatelliteHandle {
    command_tx: mpsc::Sender<SatelliteCommand>,
}

impl SatelliteHandle {
    async fn send(&self, command: SatelliteCommand) -> ServerResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ServerError::SatelliteStopped)
    }

    /// Registers an authenticated connection and its outbound queue.
    pub async fn attach(&self, id: ConnectionId, outbound: mpsc::Sender<Message>) -> ServerResult<()> {
        self.send(SatelliteCommand::Attach { id, outbound }).await
    }

    /// Unregisters a connection. Never fails; a stopped satellite has
    /// nothing left to clean up.
    pub async fn detach(&self, id: ConnectionId) {
        if self.send(SatelliteCommand::Detach { id }).await.is_err() {
            debug!(connection = id, "Satellite gone, skipping detach");
        }
    }

    /// Forwards a message from an authenticated connection.
    pub async fn inbound(&self, id: ConnectionId, message: Message) -> ServerResult<()> {
        self.send(SatelliteCommand::Inbound { id, message }).await
    }

    /// Injects a wake signal. `None` uses the first active wake word.
    pub async fn wake(&self, wake_word: Option<String>) -> ServerResult<()> {
        self.send(SatelliteCommand::Wake { wake_word }).await
    }

    /// Returns a snapshot of the satellite.
    pub async fn status(&self) -> ServerResult<SatelliteStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(SatelliteCommand::Status { reply }).await?;
        rx.await.map_err(|_| ServerError::SatelliteStopped)
    }

    /// Asks the event loop to stop.
    pub async fn shutdown(&self) {
        let _ = self.send(SatelliteCommand::Shutdown).await;
    }
}

/// The satellite: owner of every piece of mutable state.
pub struct Satellite {
    config: ServerConfig,
    entities: EntityRegistry,
    players: Players,
    playbacks: PlaybackTracker,
    playback_rx: mpsc::UnboundedReceiver<PlaybackId>,
    indicator: Box<dyn Indicator>,
    detector: Option<Box<dyn WakeDetector>>,
    audio: Option<AudioConsumer>,
    voice: VoiceSession,
    timers: TimerRegistry,
    connections: BTreeMap<ConnectionId, mpsc::Sender<Message>>,
    voice_peer: Option<ConnectionId>,
    muted: bool,
    active_wake_words: Vec<String>,
    alarm_at: Option<Instant>,
    command_tx: mpsc::Sender<SatelliteCommand>,
    command_rx: mpsc::Receiver<SatelliteCommand>,
}

impl Satellite {
    /// Creates a satellite with a logging indicator, no wake detector and
    /// no audio source.
    pub fn new(config: ServerConfig, entities: EntityRegistry, players: Players) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (playbacks, playback_rx) = PlaybackTracker::new();
        let active_wake_words = config.filter_active_wake_words(&config.active_wake_words);
        let voice = VoiceSession::new(config.voice_timings());

        Self {
            config,
            entities,
            players,
            playbacks,
            playback_rx,
            indicator: Box::new(LogIndicator),
            detector: None,
            audio: None,
            voice,
            timers: TimerRegistry::new(),
            connections: BTreeMap::new(),
            voice_peer: None,
            muted: false,
            active_wake_words,
            alarm_at: None,
            command_tx,
            command_rx,
        }
    }

    /// Builder: set the status indicator.
    pub fn with_indicator(mut self, indicator: Box<dyn Indicator>) -> Self {
        self.indicator = indicator;
        self
    }

    /// Builder: set the wake word detector fed from captured audio.
    pub fn with_wake_detector(mut self, mut detector: Box<dyn WakeDetector>) -> Self {
        detector.set_active_wake_words(&self.active_wake_words);
        self.detector = Some(detector);
        self
    }

    /// Builder: set the captured audio source.
    pub fn with_audio(mut self, audio: AudioConsumer) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Returns a handle for sending commands to the satellite.
    pub fn handle(&self) -> SatelliteHandle {
        SatelliteHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Runs the event loop until [`SatelliteHandle::shutdown`].
    pub async fn run(mut self) {
        info!(
            entities = self.entities.len(),
            wake_words = ?self.active_wake_words,
            audio = self.audio.is_some(),
            "Satellite started"
        );
        self.indicator.set(IndicatorState::Idle);

        let mut tick = tokio::time::interval_at(Instant::now() + Duration::from_secs(1), Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            let deadline = self.voice.deadline();
            let alarm_at = self.alarm_at;

            // Completions first: a command may depend on a finished playback.
            tokio::select! {
                biased;

                Some(id) = self.playback_rx.recv() => self.on_playback_done(id),
                command = self.command_rx.recv() => match command {
                    Some(SatelliteCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                frame = next_frame(self.audio.as_mut()), if self.audio.is_some() => match frame {
                    Some(frame) => self.on_audio(frame),
                    None => {
                        warn!("Audio source ended");
                        self.audio = None;
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    let actions = self.voice.on_deadline(Instant::now());
                    self.apply(actions);
                }
                _ = tick.tick() => self.on_tick(),
                _ = sleep_until_opt(alarm_at) => self.replay_alarm(),
            }
        }

        self.stop();
    }

    fn handle_command(&mut self, command: SatelliteCommand) {
        match command {
            SatelliteCommand::Attach { id, outbound } => {
                debug!(connection = id, "Connection attached");
                self.connections.insert(id, outbound);
                let mut snapshot = self.entities.list();
                snapshot.push(ListEntitiesDoneResponse {}.into());
                snapshot.extend(self.entities.states());
                for message in snapshot {
                    self.send_to(id, message);
                }
            }
            SatelliteCommand::Detach { id } => {
                self.connections.remove(&id);
                if self.voice_peer == Some(id) {
                    info!(connection = id, "Voice peer disconnected");
                    self.voice_peer = None;
                    let actions = self.voice.cancel(SessionEnd::ConnectionLost);
                    self.apply(actions);
                }
            }
            SatelliteCommand::Inbound { id, message } => self.on_message(id, message),
            SatelliteCommand::Wake { wake_word } => {
                let phrase = self.wake_phrase(wake_word.as_deref());
                self.on_wake(phrase);
            }
            SatelliteCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SatelliteCommand::Shutdown => {}
        }
    }

    fn on_message(&mut self, id: ConnectionId, message: Message) {
        if message.is_voice_event() && self.voice_peer != Some(id) {
            debug!(connection = id, message = message.name(), "Voice message from a non-voice peer");
            return;
        }
        let now = Instant::now();

        match message {
            Message::ListEntitiesRequest(_) => {
                for entity in self.entities.list() {
                    self.send_to(id, entity);
                }
                self.send_to(id, ListEntitiesDoneResponse {}.into());
            }
            Message::SubscribeStatesRequest(_) => {
                for state in self.entities.states() {
                    self.send_to(id, state);
                }
            }
            Message::SubscribeHomeassistantServicesRequest(_)
            | Message::SubscribeHomeAssistantStatesRequest(_) => {}
            Message::SwitchCommandRequest(_) | Message::MediaPlayerCommandRequest(_) => {
                self.on_entity_command(&message);
            }
            Message::SubscribeVoiceAssistantRequest(request) => {
                if request.subscribe {
                    if let Some(previous) = self.voice_peer.replace(id)
                        && previous != id
                    {
                        info!(previous, "Voice peer replaced");
                        let actions = self.voice.cancel(SessionEnd::ConnectionLost);
                        self.apply(actions);
                    }
                    info!(connection = id, flags = request.flags, "Voice peer subscribed");
                } else if self.voice_peer == Some(id) {
                    info!(connection = id, "Voice peer unsubscribed");
                    self.voice_peer = None;
                    let actions = self.voice.cancel(SessionEnd::ConnectionLost);
                    self.apply(actions);
                }
            }
            Message::VoiceAssistantResponse(response) => {
                let actions = self.voice.on_response(now, &response);
                self.apply(actions);
            }
            Message::VoiceAssistantEventResponse(event) => {
                let actions = self.voice.on_event(now, &event);
                self.apply(actions);
            }
            Message::VoiceAssistantTimerEventResponse(event) => {
                if let TimerChange::Finished(timer) = self.timers.apply(&event) {
                    self.start_ringing(&timer);
                }
            }
            Message::VoiceAssistantAnnounceRequest(request) => self.on_announce(id, request),
            Message::VoiceAssistantConfigurationRequest(_) => {
                let response = self.configuration();
                self.send_to(id, response.into());
            }
            Message::VoiceAssistantSetConfiguration(request) => {
                self.active_wake_words = self
                    .config
                    .filter_active_wake_words(&request.active_wake_words);
                info!(active = ?self.active_wake_words, "Active wake words changed");
                if let Some(detector) = self.detector.as_mut() {
                    detector.set_active_wake_words(&self.active_wake_words);
                }
            }
            other => debug!(message = other.name(), "Unhandled message"),
        }
    }

    fn on_entity_command(&mut self, command: &Message) {
        if let Some(url) = announcement_url(command)
            && self.entities.media_player().map(|p| p.key()) == command_key(command)
        {
            let purpose = PlaybackPurpose::Announcement {
                notify_peer: false,
                start_conversation: false,
            };
            self.announce(&[url.to_string()], purpose);
            return;
        }

        let was_muted = self.muted;
        let mut ctx = EntityContext {
            players: &mut self.players,
            playbacks: &mut self.playbacks,
            muted: &mut self.muted,
        };
        match self.entities.dispatch_command(command, &mut ctx) {
            Ok(state) => self.broadcast(vec![state]),
            Err(e) => {
                warn!(error = %e, "Ignoring entity command");
                return;
            }
        }

        if self.muted != was_muted {
            if self.muted {
                info!("Microphone muted");
                let actions = self.voice.cancel(SessionEnd::Muted);
                self.apply(actions);
                if let Some(audio) = self.audio.as_mut() {
                    audio.drain();
                }
            } else {
                info!("Microphone unmuted");
            }
        }
    }

    fn on_wake(&mut self, phrase: String) {
        if self.stop_ringing() {
            info!("Wake word stopped the timer alarm");
            return;
        }
        if self.muted {
            debug!("Microphone muted, ignoring wake word");
            return;
        }
        if self.voice_peer.is_none() {
            info!("No voice peer, ignoring wake word");
            return;
        }

        match self.voice.wake(Instant::now(), &phrase) {
            Ok(actions) => {
                self.supersede_announcements();
                self.apply(actions);
            }
            Err(WakeRejected::Refractory) => debug!(phrase, "Wake word inside refractory window"),
            Err(WakeRejected::Active(_)) => {}
        }
    }

    fn on_audio(&mut self, frame: AudioFrame) {
        if self.muted {
            return;
        }
        if let Some(action) = self.voice.on_frame(&frame) {
            self.apply(vec![action]);
            return;
        }
        if self.voice.is_active() {
            return;
        }

        let Some(detection) = self.detector.as_mut().and_then(|d| d.process(&frame)) else {
            return;
        };
        if !self.active_wake_words.contains(&detection.wake_word) {
            debug!(wake_word = %detection.wake_word, "Detection for an inactive wake word");
            return;
        }
        info!(wake_word = %detection.wake_word, score = detection.score, "Wake word detected");
        let phrase = self.wake_phrase(Some(&detection.wake_word));
        self.on_wake(phrase);
    }

    fn on_announce(&mut self, id: ConnectionId, request: VoiceAssistantAnnounceRequest) {
        let media: Vec<String> = [request.preannounce_media_id, request.media_id]
            .into_iter()
            .filter(|m| !m.is_empty())
            .collect();
        if media.is_empty() {
            warn!(text = %request.text, "Announcement without media");
            self.send_to(id, VoiceAssistantAnnounceFinished { success: false }.into());
            return;
        }

        let purpose = PlaybackPurpose::Announcement {
            notify_peer: true,
            start_conversation: request.start_conversation,
        };
        if !self.announce(&media, purpose) {
            self.send_to(id, VoiceAssistantAnnounceFinished { success: false }.into());
        }
    }

    /// Plays an announcement with the music ducked. Returns false when a
    /// voice session is running and the announcement was rejected.
    ///
    /// Every announcement takes exactly one duck, released when it
    /// finishes or is superseded.
    fn announce(&mut self, media: &[String], purpose: PlaybackPurpose) -> bool {
        if self.voice.is_active() {
            warn!(state = self.voice.state().as_str(), "Announcement during a voice session, rejecting");
            return false;
        }

        self.stop_ringing();
        self.supersede_announcements();
        self.playbacks.cancel(PlaybackPurpose::WakeSound);
        self.duck();

        if let Some(player) = self.entities.media_player() {
            let mut ctx = EntityContext {
                players: &mut self.players,
                playbacks: &mut self.playbacks,
                muted: &mut self.muted,
            };
            player.announce(media, purpose, &mut ctx);
            let state = player.state_message();
            self.broadcast(vec![state]);
        } else {
            let done = self.playbacks.begin(purpose);
            self.players.announcer.play(media, done);
        }
        true
    }

    fn on_playback_done(&mut self, id: PlaybackId) {
        let Some(purpose) = self.playbacks.complete(id) else {
            trace!(playback = id, "Completion for a superseded playback");
            return;
        };
        debug!(playback = id, ?purpose, "Playback finished");
        let now = Instant::now();

        match purpose {
            PlaybackPurpose::Media => {
                if let Some(player) = self.entities.media_player() {
                    player.media_finished();
                    let state = player.state_message();
                    self.broadcast(vec![state]);
                }
            }
            PlaybackPurpose::Response => {
                let actions = self.voice.on_playback_finished(now);
                self.apply(actions);
            }
            PlaybackPurpose::WakeSound => {}
            PlaybackPurpose::TimerAlarm => {
                if self.timers.is_ringing() {
                    self.alarm_at = Some(now + ALARM_GAP);
                }
            }
            PlaybackPurpose::Announcement {
                notify_peer,
                start_conversation,
            } => {
                self.finish_announcement();
                if notify_peer {
                    self.send_to_voice_peer(VoiceAssistantAnnounceFinished { success: true }.into());
                }
                if start_conversation && !self.muted && self.voice_peer.is_some() {
                    match self.voice.start_conversation(now) {
                        Ok(actions) => self.apply(actions),
                        Err(rejected) => debug!(?rejected, "Could not start conversation"),
                    }
                }
                // After the follow-up session took its own duck.
                self.unduck();
            }
        }
    }

    fn finish_announcement(&mut self) {
        if let Some(player) = self.entities.media_player() {
            player.announcement_finished(&mut self.players);
            let state = player.state_message();
            self.broadcast(vec![state]);
        }
    }

    /// Drops announcements that are about to be replaced on the announcer.
    fn supersede_announcements(&mut self) {
        let superseded = self
            .playbacks
            .cancel_where(|p| matches!(p, PlaybackPurpose::Announcement { .. }));
        for purpose in superseded {
            debug!(?purpose, "Announcement superseded");
            self.finish_announcement();
            if let PlaybackPurpose::Announcement {
                notify_peer: true, ..
            } = purpose
            {
                self.send_to_voice_peer(VoiceAssistantAnnounceFinished { success: false }.into());
            }
            self.unduck();
        }
    }

    fn on_tick(&mut self) {
        for timer in self.timers.tick(1) {
            self.send_to_voice_peer(timer.finished_event().into());
            self.start_ringing(&timer);
        }
    }

    fn start_ringing(&mut self, timer: &Timer) {
        if !self.timers.start_ringing() {
            debug!(timer = %timer.id, "Alarm already ringing");
            return;
        }
        info!(timer = %timer.id, name = %timer.name, "Timer alarm ringing");

        if self.voice.is_active() {
            let actions = self.voice.cancel(SessionEnd::Stopped);
            self.apply(actions);
        }
        self.supersede_announcements();
        self.duck();
        self.play_alarm();
    }

    fn play_alarm(&mut self) {
        self.alarm_at = None;
        match self.config.timer_finished_sound.clone() {
            Some(sound) => {
                self.playbacks.cancel(PlaybackPurpose::WakeSound);
                let done = self.playbacks.begin(PlaybackPurpose::TimerAlarm);
                self.players.announcer.play(&[sound], done);
            }
            None => debug!("No timer sound configured"),
        }
    }

    fn replay_alarm(&mut self) {
        if self.timers.is_ringing() {
            self.play_alarm();
        } else {
            self.alarm_at = None;
        }
    }

    /// Silences the alarm. Returns false if it was not ringing.
    fn stop_ringing(&mut self) -> bool {
        if !self.timers.stop_ringing() {
            return false;
        }
        self.alarm_at = None;
        if self.playbacks.is_active(PlaybackPurpose::TimerAlarm) {
            self.playbacks.cancel(PlaybackPurpose::TimerAlarm);
            self.players.announcer.stop();
        }
        self.unduck();
        true
    }

    fn apply(&mut self, actions: Vec<VoiceAction>) {
        for action in actions {
            match action {
                VoiceAction::Send(message) => self.send_to_voice_peer(message),
                VoiceAction::SendAudio { sequence, data } => {
                    trace!(sequence, bytes = data.len(), "Streaming audio");
                    self.send_to_voice_peer(VoiceAssistantAudio { data, end: false }.into());
                }
                VoiceAction::Duck => self.duck(),
                VoiceAction::Unduck => self.unduck(),
                VoiceAction::Indicator(state) => self.indicator.set(state),
                VoiceAction::PlayWakeSound => {
                    if let Some(sound) = self.config.wakeup_sound.clone() {
                        let done = self.playbacks.begin(PlaybackPurpose::WakeSound);
                        self.players.announcer.play(&[sound], done);
                    }
                }
                VoiceAction::PlayResponse(url) => {
                    self.playbacks.cancel(PlaybackPurpose::WakeSound);
                    let done = self.playbacks.begin(PlaybackPurpose::Response);
                    self.players.announcer.play(&[url], done);
                }
                VoiceAction::StopResponse => {
                    self.playbacks.cancel(PlaybackPurpose::Response);
                    self.players.announcer.stop();
                }
                VoiceAction::Publish(source, value) => {
                    let states = self.entities.publish(source, &value);
                    self.broadcast(states);
                }
                VoiceAction::Ended(end) => debug!(?end, "Voice session ended"),
            }
        }
    }

    fn duck(&mut self) {
        if let Some(player) = self.entities.media_player() {
            player.duck(&mut self.players);
        }
    }

    fn unduck(&mut self) {
        if let Some(player) = self.entities.media_player() {
            player.unduck(&mut self.players);
        }
    }

    fn wake_phrase(&self, wake_word: Option<&str>) -> String {
        let id = wake_word.or_else(|| self.active_wake_words.first().map(String::as_str));
        match id {
            Some(id) => self
                .config
                .wake_word(id)
                .map_or_else(|| id.to_string(), |ww| ww.phrase.clone()),
            None => String::new(),
        }
    }

    fn configuration(&self) -> VoiceAssistantConfigurationResponse {
        VoiceAssistantConfigurationResponse {
            available_wake_words: self
                .config
                .wake_words
                .iter()
                .map(|ww| VoiceAssistantWakeWord {
                    id: ww.id.clone(),
                    wake_word: ww.phrase.clone(),
                    trained_languages: ww.trained_languages.clone(),
                })
                .collect(),
            active_wake_words: self.active_wake_words.clone(),
            max_active_wake_words: MAX_ACTIVE_WAKE_WORDS as u32,
        }
    }

    fn status(&self) -> SatelliteStatus {
        SatelliteStatus {
            session_state: self.voice.state(),
            session_id: self.voice.session_id(),
            voice_peer: self.voice_peer,
            connections: self.connections.len(),
            muted: self.muted,
            timers: self.timers.iter().cloned().collect(),
            ringing: self.timers.is_ringing(),
            active_wake_words: self.active_wake_words.clone(),
            dropped_audio_frames: self.audio.as_ref().map_or(0, |a| a.dropped_frames()),
        }
    }

    fn send_to_voice_peer(&self, message: Message) {
        match self.voice_peer {
            Some(id) => self.send_to(id, message),
            None => debug!(message = message.name(), "No voice peer, dropping message"),
        }
    }

    fn send_to(&self, id: ConnectionId, message: Message) {
        let Some(outbound) = self.connections.get(&id) else {
            return;
        };
        // Streamed audio may not use the tail of the queue, so a slow peer
        // loses audio before it loses control messages.
        if is_streamed_audio(&message) && outbound.capacity() <= control_reserve(outbound) {
            trace!(connection = id, "Outbound queue filling up, dropping audio");
            return;
        }
        match outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(connection = id, message = message.name(), "Outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = id, "Connection closing, dropping message");
            }
        }
    }

    fn broadcast(&self, messages: Vec<Message>) {
        for message in messages {
            for id in self.connections.keys() {
                self.send_to(*id, message.clone());
            }
        }
    }

    fn stop(&mut self) {
        let actions = self.voice.cancel(SessionEnd::Stopped);
        self.apply(actions);
        self.stop_ringing();
        self.playbacks.cancel_where(|_| true);
        self.players.announcer.stop();
        self.players.music.stop();
        self.indicator.set(IndicatorState::Idle);
        self.connections.clear();
        info!("Satellite stopped");
    }
}

fn is_streamed_audio(message: &Message) -> bool {
    matches!(message, Message::VoiceAssistantAudio(audio) if !audio.end)
}

/// Outbound slots only control messages may fill.
fn control_reserve(outbound: &mpsc::Sender<Message>) -> usize {
    (outbound.max_capacity() / 4).max(1)
}

async fn next_frame(audio: Option<&mut AudioConsumer>) -> Option<AudioFrame> {
    match audio {
        Some(audio) => audio.pull().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use voicesat_protocol::{
        MediaPlayerCommandRequest, SubscribeVoiceAssistantRequest, SwitchCommandRequest,
        VoiceAssistantEventResponse,
        VoiceAssistantEventType, VoiceAssistantRequest, VoiceAssistantResponse,
        VoiceAssistantSetConfiguration, VoiceAssistantTimerEventResponse,
        VoiceAssistantTimerEventType,
    };

    use crate::audio::{AudioProducer, audio_channel};
    use crate::collaborators::WakeDetection;
    use crate::collaborators::testing::{PlayerCall, PlayerLog, RecordingIndicator, RecordingPlayer};
    use crate::config::WakeWordInfo;
    use crate::entity::{MediaPlayerEntity, SwitchEntity, SwitchRole};

    const PEER: ConnectionId = 1;
    const MUTE_KEY: u32 = 2;

    struct Harness {
        handle: SatelliteHandle,
        music: PlayerLog,
        announcer: PlayerLog,
        indicator: Arc<Mutex<Vec<IndicatorState>>>,
    }

    fn spawn(config: ServerConfig, audio: Option<AudioConsumer>) -> Harness {
        let mut entities = EntityRegistry::new();
        entities.register(Box::new(MediaPlayerEntity::new(1, "media_player", "Media Player")));
        entities.register(Box::new(
            SwitchEntity::new(MUTE_KEY, "mute", "Mute").with_role(SwitchRole::Mute),
        ));

        let (music, music_log) = RecordingPlayer::new();
        let (announcer, announcer_log) = RecordingPlayer::new();
        let indicator = RecordingIndicator::default();

        let mut satellite = Satellite::new(
            config,
            entities,
            Players::new(Box::new(music), Box::new(announcer)),
        )
        .with_indicator(Box::new(indicator.clone()));
        if let Some(audio) = audio {
            satellite = satellite.with_audio(audio);
        }
        let handle = satellite.handle();
        tokio::spawn(satellite.run());

        Harness {
            handle,
            music: music_log,
            announcer: announcer_log,
            indicator: indicator.0,
        }
    }

    impl Harness {
        /// Attaches and subscribes the voice peer, discarding the snapshot.
        async fn voice_peer(&self) -> mpsc::Receiver<Message> {
            let (tx, mut rx) = mpsc::channel(256);
            self.handle.attach(PEER, tx).await.unwrap();
            self.send(SubscribeVoiceAssistantRequest {
                subscribe: true,
                flags: 1,
            })
            .await;
            while rx.try_recv().is_ok() {}
            rx
        }

        /// Sends a message as the voice peer and waits until it was handled.
        async fn send(&self, message: impl Into<Message>) {
            self.handle.inbound(PEER, message.into()).await.unwrap();
            self.handle.status().await.unwrap();
        }

        async fn status(&self) -> SatelliteStatus {
            self.handle.status().await.unwrap()
        }
    }

    fn is_state(message: &Message) -> bool {
        matches!(
            message,
            Message::MediaPlayerStateResponse(_)
                | Message::SwitchStateResponse(_)
                | Message::TextSensorStateResponse(_)
        )
    }

    /// Next message that is not an entity state push.
    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("outbound queue closed");
            if !is_state(&message) {
                return message;
            }
        }
    }

    fn pending(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|m| !is_state(m))
            .collect()
    }

    fn event(kind: VoiceAssistantEventType, data: &[(&str, &str)]) -> VoiceAssistantEventResponse {
        VoiceAssistantEventResponse {
            event_type: kind as i32,
            data: data
                .iter()
                .map(|(name, value)| voicesat_protocol::VoiceAssistantEventData {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    fn announce_command(url: &str) -> MediaPlayerCommandRequest {
        MediaPlayerCommandRequest {
            key: 1,
            has_media_url: true,
            media_url: url.to_string(),
            has_announcement: true,
            announcement: true,
            ..Default::default()
        }
    }

    fn start_request(phrase: &str) -> Message {
        VoiceAssistantRequest {
            start: true,
            wake_word_phrase: phrase.to_string(),
            ..Default::default()
        }
        .into()
    }

    #[tokio::test]
    async fn attach_pushes_entity_snapshot() {
        let sat = spawn(ServerConfig::default(), None);
        let (tx, mut rx) = mpsc::channel(16);
        sat.handle.attach(7, tx).await.unwrap();
        sat.status().await;

        let snapshot: Vec<Message> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(
            &snapshot[..],
            [
                Message::ListEntitiesMediaPlayerResponse(mp),
                Message::ListEntitiesSwitchResponse(sw),
                Message::ListEntitiesDoneResponse(_),
                Message::MediaPlayerStateResponse(_),
                Message::SwitchStateResponse(_),
            ] if mp.key == 1 && mp.object_id == "media_player" && sw.object_id == "mute"
        ));
        assert_eq!(sat.status().await.connections, 1);
    }

    #[tokio::test]
    async fn three_frames_then_stop() {
        let (mut producer, consumer) = audio_channel(16);
        let sat = spawn(ServerConfig::default(), Some(consumer));
        let mut rx = sat.voice_peer().await;

        sat.handle.wake(None).await.unwrap();
        assert_eq!(next(&mut rx).await, start_request("Okay Nabu"));
        sat.send(VoiceAssistantResponse::default()).await;

        for i in 0..3u8 {
            producer.push(vec![i; 4]);
        }
        for i in 0..3u8 {
            assert_eq!(
                next(&mut rx).await,
                Message::from(VoiceAssistantAudio {
                    data: Bytes::from(vec![i; 4]),
                    end: false,
                })
            );
        }

        sat.send(event(VoiceAssistantEventType::SttVadEnd, &[])).await;
        assert_eq!(
            next(&mut rx).await,
            Message::from(VoiceAssistantAudio {
                data: Bytes::new(),
                end: true,
            })
        );

        producer.push(vec![9u8; 4]);
        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::AwaitingResponse);
        tokio::task::yield_now().await;
        sat.status().await;
        assert!(pending(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_unducks_once() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;

        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        sat.send(event(VoiceAssistantEventType::SttVadEnd, &[])).await;
        assert_eq!(sat.status().await.session_state, SessionState::AwaitingResponse);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::Idle);
        assert_eq!(sat.music.count(&PlayerCall::Duck), 1);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
        assert_eq!(sat.indicator.lock().unwrap().last(), Some(&IndicatorState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn response_playback_completes_session() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;

        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        sat.send(event(VoiceAssistantEventType::SttVadEnd, &[])).await;
        sat.send(event(VoiceAssistantEventType::TtsEnd, &[("url", "http://hub/reply.mp3")]))
            .await;
        assert_eq!(sat.status().await.session_state, SessionState::Responding);
        assert_eq!(sat.announcer.played(), vec![vec!["http://hub/reply.mp3".to_string()]]);

        assert!(sat.announcer.finish_current());
        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::Idle);
        assert!(pending(&mut rx).contains(&VoiceAssistantAnnounceFinished { success: true }.into()));
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test]
    async fn wake_without_voice_peer_is_ignored() {
        let sat = spawn(ServerConfig::default(), None);
        sat.handle.wake(None).await.unwrap();
        assert_eq!(sat.status().await.session_state, SessionState::Idle);
    }

    #[tokio::test]
    async fn muting_cancels_session_and_blocks_wake() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        let _ = pending(&mut rx);

        sat.send(SwitchCommandRequest {
            key: MUTE_KEY,
            state: true,
        })
        .await;
        let status = sat.status().await;
        assert!(status.muted);
        assert_eq!(status.session_state, SessionState::Idle);
        assert!(pending(&mut rx).contains(&Message::from(VoiceAssistantRequest {
            start: false,
            ..Default::default()
        })));

        sat.handle.wake(None).await.unwrap();
        assert_eq!(sat.status().await.session_state, SessionState::Idle);
    }

    #[tokio::test]
    async fn announcement_plays_and_reports() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;

        sat.send(VoiceAssistantAnnounceRequest {
            media_id: "http://hub/announce.mp3".to_string(),
            text: "Dinner is ready".to_string(),
            preannounce_media_id: "http://hub/chime.flac".to_string(),
            start_conversation: false,
        })
        .await;
        assert_eq!(
            sat.announcer.played(),
            vec![vec![
                "http://hub/chime.flac".to_string(),
                "http://hub/announce.mp3".to_string()
            ]]
        );

        assert!(sat.announcer.finish_current());
        sat.status().await;
        assert_eq!(
            pending(&mut rx),
            vec![Message::from(VoiceAssistantAnnounceFinished { success: true })]
        );
        assert_eq!(sat.music.count(&PlayerCall::Duck), 1);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test]
    async fn announcement_with_conversation_opens_session() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;

        sat.send(VoiceAssistantAnnounceRequest {
            media_id: "http://hub/question.mp3".to_string(),
            start_conversation: true,
            ..Default::default()
        })
        .await;
        assert!(sat.announcer.finish_current());
        let status = sat.status().await;

        assert_eq!(status.session_state, SessionState::AwaitingStart);
        let sent = pending(&mut rx);
        assert_eq!(sent.first(), Some(&VoiceAssistantAnnounceFinished { success: true }.into()));
        assert!(sent.contains(&start_request("")));
        // The session keeps the music ducked.
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 0);
    }

    #[tokio::test]
    async fn announcement_during_session_is_rejected() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.status().await;
        let _ = pending(&mut rx);

        sat.send(VoiceAssistantAnnounceRequest {
            media_id: "http://hub/a.mp3".to_string(),
            ..Default::default()
        })
        .await;
        assert_eq!(
            pending(&mut rx),
            vec![Message::from(VoiceAssistantAnnounceFinished { success: false })]
        );
        assert_eq!(sat.status().await.session_state, SessionState::AwaitingStart);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_timer_rings_until_wake() {
        let config = ServerConfig::default().with_timer_finished_sound("/usr/share/sounds/alarm.flac");
        let sat = spawn(config, None);
        let mut rx = sat.voice_peer().await;

        sat.send(VoiceAssistantTimerEventResponse {
            event_type: VoiceAssistantTimerEventType::Started as i32,
            timer_id: "pasta".to_string(),
            name: "pasta".to_string(),
            total_seconds: 2,
            seconds_left: 2,
            is_active: true,
        })
        .await;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let status = sat.status().await;
        assert!(status.ringing);
        assert!(status.timers.is_empty());
        let sent = pending(&mut rx);
        assert!(matches!(
            &sent[..],
            [Message::VoiceAssistantTimerEventResponse(e)]
                if e.timer_id == "pasta"
                    && e.event_type == VoiceAssistantTimerEventType::Finished as i32
        ));
        assert_eq!(sat.announcer.played().len(), 1);

        // One round ends; the next starts after the gap.
        assert!(sat.announcer.finish_current());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sat.announcer.played().len(), 2);

        sat.handle.wake(None).await.unwrap();
        let status = sat.status().await;
        assert!(!status.ringing);
        assert_eq!(status.session_state, SessionState::Idle);
        assert_eq!(sat.announcer.count(&PlayerCall::Stop), 1);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test]
    async fn hub_finish_rings_once() {
        let sat = spawn(ServerConfig::default().with_timer_finished_sound("alarm.wav"), None);
        let _rx = sat.voice_peer().await;
        let finished = VoiceAssistantTimerEventResponse {
            event_type: VoiceAssistantTimerEventType::Finished as i32,
            timer_id: "tea".to_string(),
            ..Default::default()
        };

        sat.send(finished.clone()).await;
        sat.send(finished).await;
        assert!(sat.status().await.ringing);
        assert_eq!(sat.announcer.played().len(), 1);
        assert_eq!(sat.music.count(&PlayerCall::Duck), 1);
    }

    #[tokio::test]
    async fn configuration_roundtrip() {
        let config = ServerConfig::default().with_wake_words(
            vec![
                WakeWordInfo::new("okay_nabu", "Okay Nabu"),
                WakeWordInfo::new("hey_jarvis", "Hey Jarvis"),
                WakeWordInfo::new("alexa", "Alexa"),
            ],
            vec!["okay_nabu".to_string()],
        );
        let sat = spawn(config, None);
        let mut rx = sat.voice_peer().await;

        sat.send(voicesat_protocol::VoiceAssistantConfigurationRequest {}).await;
        match &pending(&mut rx)[..] {
            [Message::VoiceAssistantConfigurationResponse(response)] => {
                assert_eq!(response.available_wake_words.len(), 3);
                assert_eq!(response.active_wake_words, vec!["okay_nabu".to_string()]);
                assert_eq!(response.max_active_wake_words, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        sat.send(VoiceAssistantSetConfiguration {
            active_wake_words: vec![
                "hey_jarvis".to_string(),
                "unknown".to_string(),
                "alexa".to_string(),
                "okay_nabu".to_string(),
            ],
        })
        .await;
        assert_eq!(
            sat.status().await.active_wake_words,
            vec!["hey_jarvis".to_string(), "alexa".to_string()]
        );
    }

    struct FirstFrameDetector;

    impl WakeDetector for FirstFrameDetector {
        fn process(&mut self, frame: &AudioFrame) -> Option<WakeDetection> {
            (frame.sequence == 0).then(|| WakeDetection {
                wake_word: "okay_nabu".to_string(),
                score: 0.9,
            })
        }
    }

    #[tokio::test]
    async fn detector_opens_session() {
        let (mut producer, consumer): (AudioProducer, AudioConsumer) = audio_channel(8);
        let mut entities = EntityRegistry::new();
        entities.register(Box::new(MediaPlayerEntity::new(1, "media_player", "Media Player")));
        let (music, _) = RecordingPlayer::new();
        let (announcer, _) = RecordingPlayer::new();
        let satellite = Satellite::new(
            ServerConfig::default(),
            entities,
            Players::new(Box::new(music), Box::new(announcer)),
        )
        .with_wake_detector(Box::new(FirstFrameDetector))
        .with_audio(consumer);
        let handle = satellite.handle();
        tokio::spawn(satellite.run());

        let (tx, mut rx) = mpsc::channel(64);
        handle.attach(PEER, tx).await.unwrap();
        handle
            .inbound(PEER, SubscribeVoiceAssistantRequest { subscribe: true, flags: 0 }.into())
            .await
            .unwrap();
        handle.status().await.unwrap();
        while rx.try_recv().is_ok() {}

        producer.push(vec![0u8; 4]);
        assert_eq!(next(&mut rx).await, start_request("Okay Nabu"));
        assert_eq!(
            handle.status().await.unwrap().session_state,
            SessionState::AwaitingStart
        );
    }

    #[tokio::test]
    async fn voice_events_from_other_connections_are_ignored() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();

        let (tx, _other_rx) = mpsc::channel(16);
        sat.handle.attach(2, tx).await.unwrap();
        sat.handle
            .inbound(2, VoiceAssistantResponse::default().into())
            .await
            .unwrap();
        assert_eq!(sat.status().await.session_state, SessionState::AwaitingStart);
    }

    #[tokio::test]
    async fn voice_peer_detach_cancels_session() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.handle.detach(PEER).await;

        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::Idle);
        assert_eq!(status.voice_peer, None);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test]
    async fn full_queue_keeps_room_for_control_messages() {
        let (music, _) = RecordingPlayer::new();
        let (announcer, _) = RecordingPlayer::new();
        let mut satellite = Satellite::new(
            ServerConfig::default(),
            EntityRegistry::new(),
            Players::new(Box::new(music), Box::new(announcer)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        satellite.connections.insert(PEER, tx);

        for i in 0..8u8 {
            satellite.send_to(
                PEER,
                VoiceAssistantAudio {
                    data: Bytes::from(vec![i; 4]),
                    end: false,
                }
                .into(),
            );
        }
        let end_of_audio = Message::from(VoiceAssistantAudio {
            data: Bytes::new(),
            end: true,
        });
        satellite.send_to(PEER, end_of_audio.clone());
        satellite.send_to(PEER, VoiceAssistantAnnounceFinished { success: true }.into());

        let sent = pending(&mut rx);
        assert_eq!(sent.len(), 8);
        assert!(sent[..6].iter().all(is_streamed_audio));
        assert_eq!(sent[6], end_of_audio);
        assert_eq!(sent[7], VoiceAssistantAnnounceFinished { success: true }.into());
    }

    #[tokio::test]
    async fn media_player_announcement_keeps_session_duck() {
        let sat = spawn(ServerConfig::default(), None);
        let mut rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        sat.send(event(VoiceAssistantEventType::SttVadEnd, &[])).await;
        let _ = pending(&mut rx);

        sat.send(announce_command("http://hub/doorbell.mp3")).await;
        assert!(!sat.announcer.finish_current());
        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::AwaitingResponse);
        assert!(sat.announcer.played().is_empty());
        assert_eq!(sat.music.count(&PlayerCall::Duck), 1);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 0);
    }

    #[tokio::test]
    async fn media_player_announcement_takes_its_own_duck() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;

        sat.send(announce_command("http://hub/doorbell.mp3")).await;
        assert_eq!(sat.announcer.played(), vec![vec!["http://hub/doorbell.mp3".to_string()]]);
        assert_eq!(sat.music.count(&PlayerCall::Duck), 1);

        assert!(sat.announcer.finish_current());
        sat.status().await;
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_survives_media_player_announcement() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        sat.send(event(VoiceAssistantEventType::TtsEnd, &[("url", "http://hub/reply.mp3")]))
            .await;
        assert_eq!(sat.status().await.session_state, SessionState::Responding);

        sat.send(announce_command("http://hub/doorbell.mp3")).await;
        assert_eq!(sat.announcer.played(), vec![vec!["http://hub/reply.mp3".to_string()]]);

        assert!(sat.announcer.finish_current());
        assert_eq!(sat.status().await.session_state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_response_playback_releases_session() {
        let sat = spawn(ServerConfig::default(), None);
        let _rx = sat.voice_peer().await;
        sat.handle.wake(None).await.unwrap();
        sat.send(VoiceAssistantResponse::default()).await;
        sat.send(event(VoiceAssistantEventType::TtsEnd, &[("url", "http://hub/reply.mp3")]))
            .await;
        assert_eq!(sat.status().await.session_state, SessionState::Responding);

        tokio::time::sleep(crate::voice::MAX_RESPONSE_PLAYBACK + Duration::from_secs(1)).await;
        let status = sat.status().await;
        assert_eq!(status.session_state, SessionState::Idle);
        assert_eq!(sat.announcer.count(&PlayerCall::Stop), 1);
        assert_eq!(sat.music.count(&PlayerCall::Unduck), 1);
    }

    #[tokio::test]
    async fn replaced_wake_sound_is_forgotten() {
        let config = ServerConfig::default()
            .with_wakeup_sound("wake.flac")
            .with_timer_finished_sound("alarm.flac");
        let (music, _) = RecordingPlayer::new();
        let (announcer, announcer_log) = RecordingPlayer::new();
        let mut satellite = Satellite::new(
            config,
            EntityRegistry::new(),
            Players::new(Box::new(music), Box::new(announcer)),
        );

        satellite.apply(vec![VoiceAction::PlayWakeSound]);
        assert!(satellite.playbacks.is_active(PlaybackPurpose::WakeSound));
        satellite.play_alarm();
        assert!(!satellite.playbacks.is_active(PlaybackPurpose::WakeSound));

        satellite.apply(vec![VoiceAction::PlayWakeSound]);
        satellite.announce(&["doorbell.mp3".to_string()], PlaybackPurpose::Announcement {
            notify_peer: false,
            start_conversation: false,
        });
        assert!(!satellite.playbacks.is_active(PlaybackPurpose::WakeSound));
        assert_eq!(announcer_log.played().len(), 4);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let sat = spawn(ServerConfig::default(), None);
        sat.handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(sat.handle.status().await, Err(ServerError::SatelliteStopped)));
    }
}
