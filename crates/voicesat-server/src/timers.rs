//! Countdown timers requested by the voice pipeline.
//!
//! The hub owns timer semantics and keeps us informed through timer
//! events. The satellite mirrors them, counts them down locally so it can
//! ring even if the hub is unreachable, and tracks whether the alarm is
//! currently sounding.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};

use voicesat_protocol::{VoiceAssistantTimerEventResponse, VoiceAssistantTimerEventType};

/// Finished timer ids remembered to recognise the hub's own finish event.
const RECENTLY_FINISHED: usize = 16;

/// One countdown timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub id: String,
    pub name: String,
    pub total_seconds: u32,
    pub remaining_seconds: u32,
    pub is_active: bool,
}

impl Timer {
    fn from_event(event: &VoiceAssistantTimerEventResponse) -> Self {
        Self {
            id: event.timer_id.clone(),
            name: event.name.clone(),
            total_seconds: event.total_seconds,
            remaining_seconds: event.seconds_left,
            is_active: event.is_active,
        }
    }

    /// Timer event announcing that this timer finished.
    pub fn finished_event(&self) -> VoiceAssistantTimerEventResponse {
        VoiceAssistantTimerEventResponse {
            event_type: VoiceAssistantTimerEventType::Finished as i32,
            timer_id: self.id.clone(),
            name: self.name.clone(),
            total_seconds: self.total_seconds,
            seconds_left: 0,
            is_active: false,
        }
    }
}

/// What applying a hub timer event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerChange {
    Started(Timer),
    Updated(Timer),
    Cancelled(String),
    /// The hub says the timer finished and it has not rung here yet.
    Finished(Timer),
    /// Nothing to do (unknown timer, already finished locally).
    Ignored,
}

/// Tracks timers and the alarm state.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: BTreeMap<String, Timer>,
    recently_finished: VecDeque<String>,
    ringing: bool,
}

impl TimerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a timer event from the hub.
    pub fn apply(&mut self, event: &VoiceAssistantTimerEventResponse) -> TimerChange {
        let Ok(kind) = VoiceAssistantTimerEventType::try_from(event.event_type) else {
            debug!(event_type = event.event_type, "Unknown timer event type");
            return TimerChange::Ignored;
        };

        match kind {
            VoiceAssistantTimerEventType::Started => {
                let timer = Timer::from_event(event);
                info!(timer = %timer.id, name = %timer.name, seconds = timer.total_seconds, "Timer started");
                self.timers.insert(timer.id.clone(), timer.clone());
                TimerChange::Started(timer)
            }
            VoiceAssistantTimerEventType::Updated => {
                let timer = Timer::from_event(event);
                debug!(timer = %timer.id, left = timer.remaining_seconds, active = timer.is_active, "Timer updated");
                self.timers.insert(timer.id.clone(), timer.clone());
                TimerChange::Updated(timer)
            }
            VoiceAssistantTimerEventType::Cancelled => {
                if self.timers.remove(&event.timer_id).is_some() {
                    info!(timer = %event.timer_id, "Timer cancelled");
                    TimerChange::Cancelled(event.timer_id.clone())
                } else {
                    TimerChange::Ignored
                }
            }
            VoiceAssistantTimerEventType::Finished => {
                if self.recently_finished.contains(&event.timer_id) {
                    debug!(timer = %event.timer_id, "Timer already finished locally");
                    return TimerChange::Ignored;
                }
                let timer = self
                    .timers
                    .remove(&event.timer_id)
                    .unwrap_or_else(|| Timer::from_event(event));
                self.remember_finished(&timer.id);
                info!(timer = %timer.id, name = %timer.name, "Timer finished");
                TimerChange::Finished(timer)
            }
        }
    }

    /// Advances active timers by `seconds`; returns the ones that reached zero.
    pub fn tick(&mut self, seconds: u32) -> Vec<Timer> {
        let mut finished = Vec::new();
        for timer in self.timers.values_mut().filter(|t| t.is_active) {
            timer.remaining_seconds = timer.remaining_seconds.saturating_sub(seconds);
            if timer.remaining_seconds == 0 {
                finished.push(timer.id.clone());
            }
        }

        finished
            .into_iter()
            .filter_map(|id| {
                let timer = self.timers.remove(&id)?;
                self.remember_finished(&id);
                info!(timer = %timer.id, name = %timer.name, "Timer reached zero");
                Some(timer)
            })
            .collect()
    }

    fn remember_finished(&mut self, id: &str) {
        if self.recently_finished.len() == RECENTLY_FINISHED {
            self.recently_finished.pop_front();
        }
        self.recently_finished.push_back(id.to_string());
    }

    /// Marks the alarm as sounding. Returns false if it already was.
    pub fn start_ringing(&mut self) -> bool {
        !std::mem::replace(&mut self.ringing, true)
    }

    /// Silences the alarm. Returns false if it was not sounding.
    pub fn stop_ringing(&mut self) -> bool {
        std::mem::replace(&mut self.ringing, false)
    }

    /// Returns true while the alarm is sounding.
    pub fn is_ringing(&self) -> bool {
        self.ringing
    }

    /// Looks up a timer by id.
    pub fn get(&self, id: &str) -> Option<&Timer> {
        self.timers.get(id)
    }

    /// Iterates timers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Timer> {
        self.timers.values()
    }

    /// Number of known timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns true when no timer is known.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Forgets every timer and silences the alarm.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.ringing = false;
    }
}
