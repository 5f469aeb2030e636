//! Voice session state machine.
//!
//! One wake signal becomes at most one voice exchange with the hub:
//!
//! ```text
//! Idle -> AwaitingStart -> Streaming -> AwaitingResponse -> Responding -> Idle
//!              \______________\_______________\_______________\___ error -> Idle
//! ```
//!
//! The machine is synchronous and owns no I/O. Every input takes the
//! current time and returns the [`VoiceAction`]s the caller must carry out,
//! which keeps it deterministic under test. Deadlines are exposed through
//! [`VoiceSession::deadline`] and fed back through
//! [`VoiceSession::on_deadline`].

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use voicesat_core::AudioFrame;
use voicesat_protocol::{
    Message, VoiceAssistantAnnounceFinished, VoiceAssistantAudio, VoiceAssistantEventResponse,
    VoiceAssistantEventType, VoiceAssistantRequest, VoiceAssistantResponse,
};

use crate::collaborators::IndicatorState;
use crate::entity::TextSource;

/// Longest response playback before the session gives up on its completion.
pub const MAX_RESPONSE_PLAYBACK: Duration = Duration::from_secs(300);

/// Timing constants of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTimings {
    /// Cooldown after an accepted wake signal.
    pub refractory_window: Duration,
    /// Time allowed for the hub to acknowledge the start request.
    pub start_timeout: Duration,
    /// Longest audio stream before listening stops locally.
    pub max_listen_duration: Duration,
    /// Time allowed for a response once streaming stopped.
    pub response_timeout: Duration,
}

impl Default for VoiceTimings {
    fn default() -> Self {
        Self {
            refractory_window: Duration::from_secs(2),
            start_timeout: Duration::from_secs(5),
            max_listen_duration: Duration::from_secs(15),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Where the session is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingStart,
    Streaming,
    AwaitingResponse,
    Responding,
}

impl SessionState {
    /// Lowercase name, published to phase text entities.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingStart => "awaiting_start",
            Self::Streaming => "streaming",
            Self::AwaitingResponse => "awaiting_response",
            Self::Responding => "responding",
        }
    }

    /// Returns true for every state but `Idle`.
    pub fn is_active(self) -> bool {
        self != Self::Idle
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Response played or the run ended without one.
    Completed,
    /// An expected event did not arrive in time.
    Timeout(SessionState),
    /// The hub reported a pipeline error.
    PeerError { code: String, message: String },
    /// The hub refused to start the pipeline.
    PeerRejected,
    /// The voice peer went away.
    ConnectionLost,
    /// The microphone was muted.
    Muted,
    /// Stopped locally (shutdown).
    Stopped,
}

impl SessionEnd {
    fn is_error(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Why a wake signal did not open a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeRejected {
    /// A session is already running.
    Active(SessionState),
    /// Inside the cooldown after the previous accepted wake.
    Refractory,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceAction {
    /// Send a message to the voice peer.
    Send(Message),
    /// Stream one audio block to the voice peer.
    SendAudio { sequence: u64, data: Bytes },
    /// Lower ambient playback.
    Duck,
    /// Restore ambient playback.
    Unduck,
    /// Update the status indicator.
    Indicator(IndicatorState),
    /// Play the wake-up chime.
    PlayWakeSound,
    /// Play the response audio.
    PlayResponse(String),
    /// Stop the response audio.
    StopResponse,
    /// Mirror a pipeline value into text entities.
    Publish(TextSource, String),
    /// The session is over.
    Ended(SessionEnd),
}

#[derive(Debug)]
struct ActiveSession {
    id: u64,
    started_at: Instant,
    deadline: Option<Instant>,
    next_sequence: u64,
    tts_url: Option<String>,
    tts_played: bool,
    continue_conversation: bool,
    ducked: bool,
}

/// The voice session state machine.
#[derive(Debug)]
pub struct VoiceSession {
    timings: VoiceTimings,
    state: SessionState,
    active: Option<ActiveSession>,
    last_trigger: Option<Instant>,
    next_id: u64,
}

impl VoiceSession {
    /// Creates an idle machine.
    pub fn new(timings: VoiceTimings) -> Self {
        Self {
            timings,
            state: SessionState::Idle,
            active: None,
            last_trigger: None,
            next_id: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Id of the running session.
    pub fn session_id(&self) -> Option<u64> {
        self.active.as_ref().map(|s| s.id)
    }

    /// When the running session times out, if it can.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|s| s.deadline)
    }

    /// Handles a wake signal.
    ///
    /// Rejected while a session is running (logged) and dropped silently
    /// inside the refractory window after the last accepted wake.
    pub fn wake(&mut self, now: Instant, phrase: &str) -> Result<Vec<VoiceAction>, WakeRejected> {
        if self.state.is_active() {
            info!(state = self.state.as_str(), phrase, "Ignoring wake word, session already active");
            return Err(WakeRejected::Active(self.state));
        }
        if let Some(last) = self.last_trigger
            && now.saturating_duration_since(last) < self.timings.refractory_window
        {
            return Err(WakeRejected::Refractory);
        }

        self.last_trigger = Some(now);
        let mut actions = Vec::new();
        self.begin(now, phrase, true, false, &mut actions);
        Ok(actions)
    }

    /// Opens a session without a wake signal (announcement follow-up).
    /// Not subject to the refractory window.
    pub fn start_conversation(&mut self, now: Instant) -> Result<Vec<VoiceAction>, WakeRejected> {
        if self.state.is_active() {
            return Err(WakeRejected::Active(self.state));
        }
        let mut actions = Vec::new();
        self.begin(now, "", false, false, &mut actions);
        Ok(actions)
    }

    fn begin(
        &mut self,
        now: Instant,
        phrase: &str,
        chime: bool,
        already_ducked: bool,
        actions: &mut Vec<VoiceAction>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        info!(session = id, phrase, "Starting voice session");

        actions.push(VoiceAction::Send(
            VoiceAssistantRequest {
                start: true,
                wake_word_phrase: phrase.to_string(),
                ..Default::default()
            }
            .into(),
        ));
        if !already_ducked {
            actions.push(VoiceAction::Duck);
        }
        self.active = Some(ActiveSession {
            id,
            started_at: now,
            deadline: Some(now + self.timings.start_timeout),
            next_sequence: 0,
            tts_url: None,
            tts_played: false,
            continue_conversation: false,
            ducked: true,
        });
        self.transition(SessionState::AwaitingStart, actions);
        actions.push(VoiceAction::Indicator(IndicatorState::Listening));
        if chime {
            actions.push(VoiceAction::PlayWakeSound);
        }
    }

    /// Handles the hub's answer to the start request.
    pub fn on_response(&mut self, now: Instant, response: &VoiceAssistantResponse) -> Vec<VoiceAction> {
        let mut actions = Vec::new();
        if self.state != SessionState::AwaitingStart {
            debug!(state = self.state.as_str(), "Ignoring voice assistant response");
            return actions;
        }
        if response.error {
            warn!(session = ?self.session_id(), "Hub refused to start the pipeline");
            self.finish(SessionEnd::PeerRejected, &mut actions);
        } else {
            self.start_streaming(now, &mut actions);
        }
        actions
    }

    /// Handles a pipeline event from the hub.
    pub fn on_event(&mut self, now: Instant, event: &VoiceAssistantEventResponse) -> Vec<VoiceAction> {
        let mut actions = Vec::new();
        let Ok(kind) = VoiceAssistantEventType::try_from(event.event_type) else {
            debug!(event_type = event.event_type, "Unknown voice event type");
            return actions;
        };
        let Some(session) = self.active.as_mut() else {
            debug!(?kind, "Voice event outside a session");
            return actions;
        };
        debug!(session = session.id, ?kind, "Voice event");

        match kind {
            VoiceAssistantEventType::Error => {
                let code = event.get("code").unwrap_or_default().to_string();
                let message = event.get("message").unwrap_or_default().to_string();
                warn!(session = session.id, %code, %message, "Pipeline error");
                self.finish(SessionEnd::PeerError { code, message }, &mut actions);
            }
            VoiceAssistantEventType::RunStart => {
                session.tts_url = event.get("url").map(str::to_string);
                session.tts_played = false;
                session.continue_conversation = false;
                if self.state == SessionState::AwaitingStart {
                    self.start_streaming(now, &mut actions);
                }
            }
            VoiceAssistantEventType::SttVadEnd | VoiceAssistantEventType::SttEnd => {
                if kind == VoiceAssistantEventType::SttEnd
                    && let Some(text) = event.get("text")
                {
                    actions.push(VoiceAction::Publish(TextSource::Transcript, text.to_string()));
                }
                if self.state == SessionState::Streaming {
                    self.stop_streaming(now, &mut actions);
                }
            }
            VoiceAssistantEventType::IntentProgress => {
                if event.get("tts_start_streaming") == Some("1") {
                    self.play_response(now, &mut actions);
                }
            }
            VoiceAssistantEventType::IntentEnd => {
                if event.get("continue_conversation") == Some("1") {
                    session.continue_conversation = true;
                }
            }
            VoiceAssistantEventType::TtsStart => {
                if let Some(text) = event.get("text") {
                    actions.push(VoiceAction::Publish(TextSource::Response, text.to_string()));
                }
            }
            VoiceAssistantEventType::TtsEnd => {
                if let Some(url) = event.get("url") {
                    session.tts_url = Some(url.to_string());
                }
                self.play_response(now, &mut actions);
            }
            VoiceAssistantEventType::RunEnd => {
                if self.state != SessionState::Responding {
                    self.response_finished(now, &mut actions);
                }
            }
            _ => {}
        }
        actions
    }

    /// Handles one captured frame. Only streamed while `Streaming`.
    pub fn on_frame(&mut self, frame: &AudioFrame) -> Option<VoiceAction> {
        if self.state != SessionState::Streaming {
            return None;
        }
        let session = self.active.as_mut()?;
        let sequence = session.next_sequence;
        session.next_sequence += 1;
        Some(VoiceAction::SendAudio {
            sequence,
            data: frame.samples.clone(),
        })
    }

    /// Handles the end of response playback.
    pub fn on_playback_finished(&mut self, now: Instant) -> Vec<VoiceAction> {
        let mut actions = Vec::new();
        if self.state == SessionState::Responding {
            self.response_finished(now, &mut actions);
        }
        actions
    }

    /// Handles an expired deadline. Reaching the listening limit stops
    /// streaming normally; any other expiry ends the session.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<VoiceAction> {
        let mut actions = Vec::new();
        let Some(deadline) = self.deadline() else {
            return actions;
        };
        if now < deadline {
            return actions;
        }

        match self.state {
            SessionState::Streaming => {
                info!(session = ?self.session_id(), "Listening limit reached");
                self.stop_streaming(now, &mut actions);
            }
            state => {
                warn!(session = ?self.session_id(), state = state.as_str(), "Voice session timed out");
                self.request_stop(&mut actions);
                self.finish(SessionEnd::Timeout(state), &mut actions);
            }
        }
        actions
    }

    /// Cancels the running session, if any.
    pub fn cancel(&mut self, end: SessionEnd) -> Vec<VoiceAction> {
        let mut actions = Vec::new();
        if self.active.is_none() {
            return actions;
        }
        if matches!(end, SessionEnd::Muted | SessionEnd::Stopped) {
            self.request_stop(&mut actions);
        }
        self.finish(end, &mut actions);
        actions
    }

    fn start_streaming(&mut self, now: Instant, actions: &mut Vec<VoiceAction>) {
        if let Some(session) = self.active.as_mut() {
            session.deadline = Some(now + self.timings.max_listen_duration);
        }
        self.transition(SessionState::Streaming, actions);
    }

    fn stop_streaming(&mut self, now: Instant, actions: &mut Vec<VoiceAction>) {
        actions.push(VoiceAction::Send(
            VoiceAssistantAudio {
                data: Bytes::new(),
                end: true,
            }
            .into(),
        ));
        if let Some(session) = self.active.as_mut() {
            session.deadline = Some(now + self.timings.response_timeout);
        }
        self.transition(SessionState::AwaitingResponse, actions);
        actions.push(VoiceAction::Indicator(IndicatorState::Processing));
    }

    fn play_response(&mut self, now: Instant, actions: &mut Vec<VoiceAction>) {
        let streaming = self.state == SessionState::Streaming;
        let Some(session) = self.active.as_mut() else {
            return;
        };
        if session.tts_played {
            return;
        }
        let Some(url) = session.tts_url.clone() else {
            return;
        };
        session.tts_played = true;
        // Completion is reported by the player; the limit only catches a
        // playback that was lost.
        session.deadline = Some(now + MAX_RESPONSE_PLAYBACK);

        if streaming {
            actions.push(VoiceAction::Send(
                VoiceAssistantAudio {
                    data: Bytes::new(),
                    end: true,
                }
                .into(),
            ));
        }
        info!(session = session.id, %url, "Playing response");
        self.transition(SessionState::Responding, actions);
        actions.push(VoiceAction::PlayResponse(url));
    }

    fn response_finished(&mut self, now: Instant, actions: &mut Vec<VoiceAction>) {
        actions.push(VoiceAction::Send(
            VoiceAssistantAnnounceFinished { success: true }.into(),
        ));

        let continue_conversation = self
            .active
            .as_ref()
            .is_some_and(|s| s.continue_conversation);
        if !continue_conversation {
            self.finish(SessionEnd::Completed, actions);
            return;
        }

        // Hand the duck over to the follow-up session.
        if let Some(session) = self.active.take() {
            info!(session = session.id, "Continuing conversation");
            actions.push(VoiceAction::Ended(SessionEnd::Completed));
        }
        self.transition(SessionState::Idle, actions);
        self.begin(now, "", false, true, actions);
    }

    fn request_stop(&self, actions: &mut Vec<VoiceAction>) {
        if matches!(
            self.state,
            SessionState::AwaitingStart | SessionState::Streaming | SessionState::AwaitingResponse
        ) {
            actions.push(VoiceAction::Send(
                VoiceAssistantRequest {
                    start: false,
                    ..Default::default()
                }
                .into(),
            ));
        }
    }

    fn finish(&mut self, end: SessionEnd, actions: &mut Vec<VoiceAction>) {
        let Some(session) = self.active.take() else {
            return;
        };
        if self.state == SessionState::Responding && end.is_error() {
            actions.push(VoiceAction::StopResponse);
        }
        if session.ducked {
            actions.push(VoiceAction::Unduck);
        }
        actions.push(VoiceAction::Indicator(IndicatorState::Idle));
        self.transition(SessionState::Idle, actions);

        let elapsed_ms = session.started_at.elapsed().as_millis() as u64;
        if end.is_error() {
            info!(session = session.id, reason = ?end, elapsed_ms, frames = session.next_sequence, "Voice session aborted");
        } else {
            info!(session = session.id, elapsed_ms, frames = session.next_sequence, "Voice session finished");
        }
        actions.push(VoiceAction::Ended(end));
    }

    fn transition(&mut self, to: SessionState, actions: &mut Vec<VoiceAction>) {
        if self.state == to {
            return;
        }
        debug!(from = self.state.as_str(), to = to.as_str(), "Voice session transition");
        self.state = to;
        actions.push(VoiceAction::Publish(TextSource::Phase, to.as_str().to_string()));
    }
}
