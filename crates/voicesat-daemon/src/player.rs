//! Player backed by an external command.
//!
//! Each media item is played by spawning the configured command with the
//! locator appended. Pause and resume use job-control signals; stop kills
//! the process. A generation counter tells the playback task whether it was
//! replaced by a newer `play` (not reported) or ended normally or by `stop`
//! (reported).

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::process::Command;
use tracing::{debug, info, warn};

use voicesat_core::clamp_unit;
use voicesat_server::{PlaybackDone, Player};

use crate::error::{DaemonError, DaemonResult};

/// Placeholder replaced by the volume in percent.
const VOLUME_PLACEHOLDER: &str = "{volume}";

#[derive(Debug, Default)]
struct Playback {
    generation: u64,
    pid: Option<u32>,
    stopped: bool,
    paused: bool,
}

/// Plays media by running an external program.
#[derive(Debug)]
pub struct CommandPlayer {
    name: &'static str,
    program: String,
    args: Vec<String>,
    volume: f32,
    duck_volume: f32,
    ducked: bool,
    current: Arc<Mutex<Playback>>,
}

impl CommandPlayer {
    /// Creates a player from a command line. The first element is the program.
    pub fn new(name: &'static str, command: &[String]) -> DaemonResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DaemonError::config(format!("{name} command is empty")))?;
        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            volume: 1.0,
            duck_volume: 0.2,
            ducked: false,
            current: Arc::new(Mutex::new(Playback::default())),
        })
    }

    /// Builder: volume used while ducked, in `[0.0, 1.0]`.
    pub fn with_duck_volume(mut self, volume: f32) -> Self {
        self.duck_volume = clamp_unit("duck_volume", volume, 0.2);
        self
    }

    /// Volume the next spawned process plays at.
    pub fn effective_volume(&self) -> f32 {
        if self.ducked {
            self.volume.min(self.duck_volume)
        } else {
            self.volume
        }
    }

    fn command_for(&self, media: &str) -> Command {
        let percent = (self.effective_volume() * 100.0).round() as u32;
        let mut command = Command::new(&self.program);
        command
            .args(
                self.args
                    .iter()
                    .map(|arg| arg.replace(VOLUME_PLACEHOLDER, &percent.to_string())),
            )
            .arg(media)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        command
    }

    fn lock(&self) -> MutexGuard<'_, Playback> {
        lock(&self.current)
    }
}

fn lock(current: &Mutex<Playback>) -> MutexGuard<'_, Playback> {
    // The guarded data stays consistent even if a holder panicked.
    current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Player for CommandPlayer {
    fn play(&mut self, media: &[String], done: PlaybackDone) {
        let generation = {
            let mut current = self.lock();
            if let Some(pid) = current.pid.take() {
                terminate(pid);
            }
            current.generation += 1;
            current.stopped = false;
            current.paused = false;
            current.generation
        };

        let commands: Vec<(String, Command)> = media
            .iter()
            .map(|item| (item.clone(), self.command_for(item)))
            .collect();
        let current = self.current.clone();
        let name = self.name;
        let program = self.program.clone();

        tokio::spawn(async move {
            for (item, mut command) in commands {
                let mut child = {
                    let mut state = lock(&current);
                    if state.generation != generation || state.stopped {
                        break;
                    }
                    match command.spawn() {
                        Ok(child) => {
                            state.pid = child.id();
                            child
                        }
                        Err(e) => {
                            let e = DaemonError::Spawn {
                                command: program.clone(),
                                source: e,
                            };
                            warn!(player = name, media = %item, error = %e, "Playback failed");
                            continue;
                        }
                    }
                };
                debug!(player = name, media = %item, "Playing");

                match child.wait().await {
                    Ok(status) if !status.success() => {
                        debug!(player = name, media = %item, %status, "Player exited")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(player = name, error = %e, "Failed to wait for player"),
                }

                let mut state = lock(&current);
                if state.generation == generation {
                    state.pid = None;
                }
            }

            let finished = {
                let mut state = lock(&current);
                let finished = state.generation == generation;
                if finished {
                    state.pid = None;
                    state.paused = false;
                }
                finished
            };
            if finished {
                done.finish();
            } else {
                debug!(player = name, playback = done.id(), "Playback superseded");
            }
        });
    }

    fn pause(&mut self) {
        let mut current = self.lock();
        if let Some(pid) = current.pid
            && !current.paused
        {
            send_signal(pid, Signal::Stop);
            current.paused = true;
        }
    }

    fn resume(&mut self) {
        let mut current = self.lock();
        if let Some(pid) = current.pid
            && current.paused
        {
            send_signal(pid, Signal::Continue);
            current.paused = false;
        }
    }

    fn stop(&mut self) {
        let mut current = self.lock();
        current.stopped = true;
        current.paused = false;
        if let Some(pid) = current.pid.take() {
            terminate(pid);
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_unit("volume", volume, self.volume);
        info!(player = self.name, volume = self.volume, "Volume set");
    }

    fn duck(&mut self) {
        self.ducked = true;
        debug!(player = self.name, volume = self.effective_volume(), "Ducked");
    }

    fn unduck(&mut self) {
        self.ducked = false;
        debug!(player = self.name, volume = self.effective_volume(), "Unducked");
    }

    fn is_playing(&self) -> bool {
        self.lock().pid.is_some()
    }
}

impl Drop for CommandPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
    Terminate,
}

/// A stopped process ignores SIGTERM until continued.
fn terminate(pid: u32) {
    send_signal(pid, Signal::Continue);
    send_signal(pid, Signal::Terminate);
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
        Signal::Terminate => libc::SIGTERM,
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signo) } != 0 {
        debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "Failed to signal player");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "Process signals are not supported on this platform");
}
