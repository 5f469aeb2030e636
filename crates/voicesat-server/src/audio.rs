//! Audio ingress: capture thread to event loop.
//!
//! A bounded crossbeam channel is the only thing shared between the
//! blocking capture thread and the async side. The producer never blocks:
//! when the queue is full it evicts the oldest frame and retries. The
//! consumer waits on a [`Notify`] instead of blocking a runtime thread.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use voicesat_core::{AudioFrame, BYTES_PER_CHUNK};

/// Creates a bounded audio queue holding at most `capacity` frames.
pub fn audio_channel(capacity: usize) -> (AudioProducer, AudioConsumer) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let notify = Arc::new(Notify::new());
    let dropped = Arc::new(AtomicU64::new(0));

    let producer = AudioProducer {
        tx: Some(tx),
        evict: rx.clone(),
        notify: notify.clone(),
        dropped: dropped.clone(),
        next_sequence: 0,
    };
    let consumer = AudioConsumer {
        rx,
        notify,
        dropped,
    };
    (producer, consumer)
}

/// Capture side of the audio queue.
pub struct AudioProducer {
    // Taken on drop so the consumer sees the disconnect before it is woken.
    tx: Option<Sender<AudioFrame>>,
    evict: Receiver<AudioFrame>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    next_sequence: u64,
}

impl AudioProducer {
    /// Queues one block of samples and returns its sequence number.
    ///
    /// Never blocks. On a full queue the oldest frame is dropped.
    pub fn push(&mut self, samples: impl Into<Bytes>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let Some(tx) = self.tx.as_ref() else {
            return sequence;
        };

        let mut frame = AudioFrame::new(sequence, samples);
        loop {
            match tx.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    if let Ok(stale) = self.evict.try_recv() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        trace!(sequence = stale.sequence, total, "Audio queue full, dropped oldest frame");
                    }
                }
                // The producer holds a receiver itself, so this cannot happen.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        self.notify.notify_one();
        sequence
    }

    /// Frames evicted so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for AudioProducer {
    fn drop(&mut self) {
        self.tx.take();
        self.notify.notify_one();
    }
}

/// Event loop side of the audio queue.
pub struct AudioConsumer {
    rx: Receiver<AudioFrame>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl AudioConsumer {
    /// Waits for the next frame. Returns `None` once the producer is gone
    /// and the queue is drained.
    ///
    /// Cancel safe: a frame is only removed from the queue when it is
    /// returned.
    pub async fn pull(&mut self) -> Option<AudioFrame> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => self.notify.notified().await,
            }
        }
    }

    /// Takes a frame if one is queued.
    pub fn try_pull(&mut self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }

    /// Discards everything queued, returning how many frames were dropped.
    pub fn drain(&mut self) -> usize {
        self.rx.try_iter().count()
    }

    /// Frames queued right now.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames evicted by the producer so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Dedicated thread that reads fixed-size blocks from a blocking source.
pub struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureThread {
    /// Spawns the capture thread reading [`BYTES_PER_CHUNK`] blocks.
    pub fn spawn<R>(source: R, producer: AudioProducer) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        Self::spawn_with_chunk_size(source, producer, BYTES_PER_CHUNK)
    }

    /// Spawns the capture thread with a custom block size.
    ///
    /// The thread ends at end of input, on a read error, or when
    /// [`CaptureThread::stop`] was called and the next block arrives.
    pub fn spawn_with_chunk_size<R>(
        mut source: R,
        mut producer: AudioProducer,
        chunk_size: usize,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                info!(chunk_size, "Audio capture started");
                let mut buffer = vec![0u8; chunk_size];
                while !thread_stop.load(Ordering::Relaxed) {
                    match source.read_exact(&mut buffer) {
                        Ok(()) => {
                            producer.push(Bytes::copy_from_slice(&buffer));
                        }
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            debug!("Audio source reached end of input");
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "Audio capture failed");
                            break;
                        }
                    }
                }
                info!(dropped = producer.dropped_frames(), "Audio capture stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Asks the thread to stop after the block it is reading.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Returns true once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stops the thread and waits for it.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Audio capture thread panicked");
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.stop();
    }
}
