//! Microphone capture through an external command.

use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};
use voicesat_server::{AudioProducer, CaptureThread};

use crate::error::{DaemonError, DaemonResult};

/// A capture process whose stdout feeds the capture thread.
pub struct CaptureProcess {
    child: Child,
    thread: CaptureThread,
}

impl CaptureProcess {
    /// Starts `command` and reads raw PCM from its stdout.
    pub fn start(command: &[String], producer: AudioProducer) -> DaemonResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| DaemonError::config("audio.capture_command is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| DaemonError::Spawn {
                command: program.clone(),
                source,
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::config("capture command has no stdout"))?;

        let thread = match CaptureThread::spawn(stdout, producer) {
            Ok(thread) => thread,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };
        info!(command = %program, pid = child.id(), "Capture started");
        Ok(Self { child, thread })
    }

    /// Kills the capture command and joins the thread.
    ///
    /// Killing the process first ends the blocking read with end of input.
    pub fn stop(mut self) {
        self.thread.stop();
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "Capture command already exited");
        }
        self.thread.join();
        match self.child.wait() {
            Ok(status) => debug!(%status, "Capture command exited"),
            Err(e) => warn!(error = %e, "Failed to reap capture command"),
        }
    }
}
