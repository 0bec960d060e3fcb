//! Audio sinks for the playback queue.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::playback::AudioSink;
use super::provider::AudioSegment;

// ── Player command ───────────────────────────────────────────────

/// Runs an external player with the segment written to a temp file.
///
/// The file path is appended as the last argument, e.g.
/// `["mpv", "--no-video", "--really-quiet"]`.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    pub fn new(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("player command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl AudioSink for CommandSink {
    async fn play(&self, segment: &AudioSegment) -> Result<()> {
        // Removed again when `path` drops.
        let path = tempfile::Builder::new()
            .prefix("voxroom-")
            .suffix(&format!(".{}", segment.extension()))
            .tempfile()
            .context("failed to create temp file for playback")?
            .into_temp_path();
        tokio::fs::write(&path, &segment.bytes)
            .await
            .context("failed to write playback file")?;

        debug!(program = %self.program, bytes = segment.bytes.len(), "Playing segment");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to run player {}", self.program))?;

        if !status.success() {
            bail!("player {} exited with {status}", self.program);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "command"
    }
}

// ── Directory ────────────────────────────────────────────────────

/// Writes each segment to a numbered file instead of playing it.
pub struct DirectorySink {
    dir: PathBuf,
    counter: AtomicU64,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl AudioSink for DirectorySink {
    async fn play(&self, segment: &AudioSegment) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self
            .dir
            .join(format!("reply-{stamp}-{n:04}.{}", segment.extension()));
        tokio::fs::write(&path, &segment.bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::info!(path = %path.display(), "Reply audio saved");
        Ok(())
    }

    fn name(&self) -> &str {
        "directory"
    }
}

// ── Recording (tests) ────────────────────────────────────────────

/// Records what it "plays". Optionally slow, optionally failing or hanging
/// on a given payload; tracks how many segments were playing at once.
#[derive(Default)]
pub struct RecordingSink {
    played: Mutex<Vec<AudioSegment>>,
    delay: Duration,
    fail_on: Option<Vec<u8>>,
    stall_on: Option<Vec<u8>>,
    fail_all: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail any segment whose bytes equal `payload`.
    pub fn failing_on(mut self, payload: &str) -> Self {
        self.fail_on = Some(payload.as_bytes().to_vec());
        self
    }

    /// Never finish a segment whose bytes equal `payload`.
    pub fn stalling_on(mut self, payload: &str) -> Self {
        self.stall_on = Some(payload.as_bytes().to_vec());
        self
    }

    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn played(&self) -> Vec<AudioSegment> {
        self.played
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn played_texts(&self) -> Vec<String> {
        self.played()
            .iter()
            .map(|s| String::from_utf8_lossy(&s.bytes).into_owned())
            .collect()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, segment: &AudioSegment) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.stall_on.as_deref() == Some(&segment.bytes[..]) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_all || self.fail_on.as_deref() == Some(&segment.bytes[..]) {
            bail!("device refused to play segment");
        }
        self.played
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(segment.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
