//! Interfaces to the things the satellite drives but does not implement:
//! audio playback, the status indicator and wake word detection.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info};

use voicesat_core::AudioFrame;

/// Identifies one playback request.
pub type PlaybackId = u64;

/// Completion token handed to a [`Player`] with every playback.
///
/// Calling [`PlaybackDone::finish`] posts the completion back onto the
/// satellite's event loop. Dropping the token without finishing means the
/// playback was superseded and nobody is told.
#[derive(Debug)]
pub struct PlaybackDone {
    id: PlaybackId,
    tx: mpsc::UnboundedSender<PlaybackId>,
}

impl PlaybackDone {
    /// Creates a completion token.
    pub fn new(id: PlaybackId, tx: mpsc::UnboundedSender<PlaybackId>) -> Self {
        Self { id, tx }
    }

    /// Identifier of the playback this token belongs to.
    pub fn id(&self) -> PlaybackId {
        self.id
    }

    /// Reports the playback as finished.
    pub fn finish(self) {
        if self.tx.send(self.id).is_err() {
            debug!(playback = self.id, "Satellite gone, dropping playback completion");
        }
    }
}

/// An audio output.
///
/// `play` replaces whatever the player was doing. A replaced playback is
/// never reported; a playback ended by [`Player::stop`] or by reaching its
/// end is.
pub trait Player: Send {
    /// Plays `media` (URLs or paths) in order, then reports through `done`.
    fn play(&mut self, media: &[String], done: PlaybackDone);
    /// Pauses the current playback.
    fn pause(&mut self);
    /// Resumes a paused playback.
    fn resume(&mut self);
    /// Stops the current playback.
    fn stop(&mut self);
    /// Sets the output volume in `[0.0, 1.0]`.
    fn set_volume(&mut self, volume: f32);
    /// Lowers the output while the satellite is talking or listening.
    fn duck(&mut self);
    /// Restores the output after [`Player::duck`].
    fn unduck(&mut self);
    /// Returns true while something is audible or paused mid-stream.
    fn is_playing(&self) -> bool;
}

/// The two outputs the satellite owns.
pub struct Players {
    /// Ambient media (music, radio).
    pub music: Box<dyn Player>,
    /// Responses, announcements and chimes.
    pub announcer: Box<dyn Player>,
}

impl Players {
    /// Groups the two outputs.
    pub fn new(music: Box<dyn Player>, announcer: Box<dyn Player>) -> Self {
        Self { music, announcer }
    }
}

/// What a playback was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPurpose {
    /// Ambient media on the music player.
    Media,
    /// Voice response audio.
    Response,
    /// Wake-up chime.
    WakeSound,
    /// One round of the timer alarm.
    TimerAlarm,
    /// Announcement through the media player entity.
    Announcement {
        /// Tell the voice peer once it has been played.
        notify_peer: bool,
        /// Open a voice session afterwards.
        start_conversation: bool,
    },
}

/// Hands out playback ids and remembers what each one is for.
#[derive(Debug)]
pub struct PlaybackTracker {
    next_id: PlaybackId,
    tx: mpsc::UnboundedSender<PlaybackId>,
    active: HashMap<PlaybackId, PlaybackPurpose>,
}

impl PlaybackTracker {
    /// Creates a tracker and the receiver that completions arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlaybackId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            next_id: 1,
            tx,
            active: HashMap::new(),
        };
        (tracker, rx)
    }

    /// Registers a new playback and returns its completion token.
    pub fn begin(&mut self, purpose: PlaybackPurpose) -> PlaybackDone {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(id, purpose);
        PlaybackDone::new(id, self.tx.clone())
    }

    /// Resolves a completion. Unknown ids were superseded or cancelled.
    pub fn complete(&mut self, id: PlaybackId) -> Option<PlaybackPurpose> {
        self.active.remove(&id)
    }

    /// Forgets every playback with the given purpose.
    pub fn cancel(&mut self, purpose: PlaybackPurpose) {
        self.active.retain(|_, p| *p != purpose);
    }

    /// Forgets every playback matching `predicate` and returns their purposes.
    pub fn cancel_where(
        &mut self,
        predicate: impl Fn(&PlaybackPurpose) -> bool,
    ) -> Vec<PlaybackPurpose> {
        let mut cancelled = Vec::new();
        self.active.retain(|_, p| {
            if predicate(p) {
                cancelled.push(*p);
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Returns true if a playback with the given purpose is outstanding.
    pub fn is_active(&self, purpose: PlaybackPurpose) -> bool {
        self.active.values().any(|p| *p == purpose)
    }
}

/// States shown by the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Idle,
    Listening,
    Processing,
}

impl IndicatorState {
    /// Lowercase name, for logs and text entities.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
        }
    }
}

/// A status output such as an LED ring.
pub trait Indicator: Send {
    fn set(&mut self, state: IndicatorState);
}

/// Indicator that only logs.
#[derive(Debug, Default)]
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, state: IndicatorState) {
        info!(state = state.as_str(), "Indicator");
    }
}

/// A positive wake word detection.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeDetection {
    /// Id of the wake word that fired.
    pub wake_word: String,
    /// Detector confidence.
    pub score: f32,
}

/// Consumes captured audio and reports wake words.
pub trait WakeDetector: Send {
    /// Feeds one frame; returns a detection when a wake word fired.
    fn process(&mut self, frame: &AudioFrame) -> Option<WakeDetection>;

    /// Restricts detection to the given wake word ids.
    fn set_active_wake_words(&mut self, _ids: &[String]) {}
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborators for tests.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum PlayerCall {
        Play(Vec<String>),
        Pause,
        Resume,
        Stop,
        Volume(f32),
        Duck,
        Unduck,
    }

    /// Shared view into a [`RecordingPlayer`].
    #[derive(Clone, Default)]
    pub struct PlayerLog {
        calls: Arc<Mutex<Vec<PlayerCall>>>,
        pending: Arc<Mutex<Vec<PlaybackDone>>>,
    }

    impl PlayerLog {
        pub fn calls(&self) -> Vec<PlayerCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, call: &PlayerCall) -> usize {
            self.calls().iter().filter(|c| *c == call).count()
        }

        pub fn played(&self) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    PlayerCall::Play(media) => Some(media),
                    _ => None,
                })
                .collect()
        }

        /// Finishes the most recent playback, as the real player would.
        pub fn finish_current(&self) -> bool {
            match self.pending.lock().unwrap().pop() {
                Some(done) => {
                    done.finish();
                    true
                }
                None => false,
            }
        }
    }

    /// Player that records every call and keeps only the latest token.
    pub struct RecordingPlayer {
        log: PlayerLog,
        playing: bool,
    }

    impl RecordingPlayer {
        pub fn new() -> (Self, PlayerLog) {
            let log = PlayerLog::default();
            (
                Self {
                    log: log.clone(),
                    playing: false,
                },
                log,
            )
        }

        fn record(&self, call: PlayerCall) {
            self.log.calls.lock().unwrap().push(call);
        }
    }

    impl Player for RecordingPlayer {
        fn play(&mut self, media: &[String], done: PlaybackDone) {
            self.record(PlayerCall::Play(media.to_vec()));
            let mut pending = self.log.pending.lock().unwrap();
            pending.clear();
            pending.push(done);
            self.playing = true;
        }

        fn pause(&mut self) {
            self.record(PlayerCall::Pause);
        }

        fn resume(&mut self) {
            self.record(PlayerCall::Resume);
        }

        fn stop(&mut self) {
            self.record(PlayerCall::Stop);
            self.playing = false;
            if let Some(done) = self.log.pending.lock().unwrap().pop() {
                done.finish();
            }
        }

        fn set_volume(&mut self, volume: f32) {
            self.record(PlayerCall::Volume(volume));
        }

        fn duck(&mut self) {
            self.record(PlayerCall::Duck);
        }

        fn unduck(&mut self) {
            self.record(PlayerCall::Unduck);
        }

        fn is_playing(&self) -> bool {
            self.playing
        }
    }

    /// Indicator that records its states.
    #[derive(Clone, Default)]
    pub struct RecordingIndicator(pub Arc<Mutex<Vec<IndicatorState>>>);

    impl Indicator for RecordingIndicator {
        fn set(&mut self, state: IndicatorState) {
            self.0.lock().unwrap().push(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completions_resolve_to_their_purpose() {
        let (mut tracker, mut rx) = PlaybackTracker::new();
        let response = tracker.begin(PlaybackPurpose::Response);
        let chime = tracker.begin(PlaybackPurpose::WakeSound);
        assert_ne!(response.id(), chime.id());

        chime.finish();
        let id = rx.recv().await.unwrap();
        assert_eq!(tracker.complete(id), Some(PlaybackPurpose::WakeSound));
        assert_eq!(tracker.complete(id), None);
        assert!(tracker.is_active(PlaybackPurpose::Response));
    }

    #[tokio::test]
    async fn cancelled_playbacks_are_forgotten() {
        let (mut tracker, mut rx) = PlaybackTracker::new();
        let alarm = tracker.begin(PlaybackPurpose::TimerAlarm);
        tracker.cancel(PlaybackPurpose::TimerAlarm);

        alarm.finish();
        let id = rx.recv().await.unwrap();
        assert_eq!(tracker.complete(id), None);
    }

    #[test]
    fn indicator_names() {
        assert_eq!(IndicatorState::Listening.as_str(), "listening");
        assert_eq!(IndicatorState::Processing.as_str(), "processing");
    }
}
