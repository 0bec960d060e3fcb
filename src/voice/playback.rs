//! Playback queue: strict FIFO, one segment at a time.
//!
//! `enqueue` appends a segment and starts the consumer task if it is not
//! already running. Each entry hands back a [`PlaybackTicket`] that resolves
//! once the segment has played, failed, or been aborted by [`PlaybackQueue::clear`].
//! A segment that outlives the play timeout counts as failed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::AudioSegment;

/// Plays one segment to completion.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackResult {
    Played,
    Failed(String),
    Aborted,
}

/// Resolves when the queued segment leaves the queue.
#[derive(Debug)]
pub struct PlaybackTicket {
    pub seq: u64,
    rx: oneshot::Receiver<PlaybackResult>,
}

impl PlaybackTicket {
    pub async fn finished(self) -> PlaybackResult {
        self.rx.await.unwrap_or(PlaybackResult::Aborted)
    }
}

struct Entry {
    seq: u64,
    segment: AudioSegment,
    done: oneshot::Sender<PlaybackResult>,
}

struct Inner {
    queue: VecDeque<Entry>,
    running: bool,
    /// Cancels the segment currently playing.
    current: CancellationToken,
}

#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<Mutex<Inner>>,
    sink: Arc<dyn AudioSink>,
    play_timeout: Option<Duration>,
    playing: Arc<AtomicBool>,
    next_seq: Arc<AtomicU64>,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                running: false,
                current: CancellationToken::new(),
            })),
            sink,
            play_timeout: None,
            playing: Arc::new(AtomicBool::new(false)),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Give up on a segment that has not finished within `limit`.
    pub fn with_play_timeout(mut self, limit: Duration) -> Self {
        self.play_timeout = Some(limit);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, segment: AudioSegment) -> PlaybackTicket {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();

        let start = {
            let mut inner = self.lock();
            inner.queue.push_back(Entry { seq, segment, done });
            let start = !inner.running;
            inner.running = true;
            start
        };
        debug!(seq, started_consumer = start, "Segment queued");

        if start {
            let queue = self.clone();
            tokio::spawn(async move { queue.consume().await });
        }
        PlaybackTicket { seq, rx }
    }

    async fn consume(self) {
        loop {
            let (entry, cancel) = {
                let mut inner = self.lock();
                match inner.queue.pop_front() {
                    Some(entry) => (entry, inner.current.clone()),
                    None => {
                        inner.running = false;
                        return;
                    }
                }
            };

            self.playing.store(true, Ordering::Release);
            let result = tokio::select! {
                played = self.play(&entry.segment) => match played {
                    Ok(()) => PlaybackResult::Played,
                    Err(e) => {
                        warn!(seq = entry.seq, sink = self.sink.name(), error = %e, "Playback failed, skipping segment");
                        PlaybackResult::Failed(e.to_string())
                    }
                },
                _ = cancel.cancelled() => PlaybackResult::Aborted,
            };
            self.playing.store(false, Ordering::Release);

            debug!(seq = entry.seq, ?result, "Segment finished");
            let _ = entry.done.send(result);
        }
    }

    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        let Some(limit) = self.play_timeout else {
            return self.sink.play(segment).await;
        };
        match tokio::time::timeout(limit, self.sink.play(segment)).await {
            Ok(played) => played,
            Err(_) => anyhow::bail!("playback timed out after {}ms", limit.as_millis()),
        }
    }

    /// Abort the playing segment and drop everything queued behind it.
    /// Returns the number of queued (not yet playing) entries dropped.
    pub fn clear(&self) -> usize {
        let dropped: Vec<Entry> = {
            let mut inner = self.lock();
            inner.current.cancel();
            inner.current = CancellationToken::new();
            inner.queue.drain(..).collect()
        };
        let count = dropped.len();
        for entry in dropped {
            let _ = entry.done.send(PlaybackResult::Aborted);
        }
        if count > 0 {
            debug!(count, "Playback queue cleared");
        }
        count
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Segments waiting behind the one playing.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.queue.is_empty() && !inner.running
    }
}
