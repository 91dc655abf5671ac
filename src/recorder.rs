//! Session controller
//!
//! `Recorder` owns the lifecycle: Idle -> Monitoring (devices open, meters
//! live) -> Recording (files + queue + writer) and back. Public operations
//! are async because two of them genuinely suspend: device open waits for
//! the stream host's reply (which may be retrying), and stop awaits the
//! writer drain under a 30-second watchdog and then the MP3 pass. All
//! operations may be called from any thread; after `dispose` they fail
//! fast.

use crate::dsp::Format;
use crate::encoder::{self, CancelToken};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, OutputPaths, StatusKind};
use crate::session_log::SessionLog;
use crate::shared::{ActiveRecording, EngineShared};
use crate::stream::StreamHost;
use crate::writer::{self, WriterFault, WriterFiles};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long `stop` waits for the writer to drain before proceeding
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `dispose` waits for the writer
const DISPOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Gains are clamped into this range at the API boundary
const MAX_GAIN: f32 = 8.0;
/// Give up probing for a free ` (N)` suffix after this many attempts
const MAX_PATH_PROBES: u32 = 10_000;

/// Devices to monitor. `None` falls back to the platform default mic and
/// the first monitor/loopback capture source respectively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorOptions {
    pub loopback_id: Option<String>,
    pub mic_id: Option<String>,
}

/// Everything needed to start a recording session
#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub loopback_id: Option<String>,
    pub mic_id: Option<String>,
    /// Output paths derive from this: `<base>-system.wav`, `<base>-mic.wav`,
    /// `<base>-mix.wav`, `<base>.txt`, and optionally `<base>.mp3`
    pub output_base: PathBuf,
    /// 0 disables the MP3 pass; anything else is clamped to 64..=320
    pub mp3_bitrate_kbps: u32,
}

impl RecordOptions {
    fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            loopback_id: self.loopback_id.clone(),
            mic_id: self.mic_id.clone(),
        }
    }
}

struct MonitorSession {
    options: MonitorOptions,
    canonical: Format,
}

struct RecordSession {
    writer: JoinHandle<()>,
    fault: WriterFault,
    paths: OutputPaths,
    mp3_bitrate: u32,
    log: SessionLog,
}

struct RecorderState {
    host: StreamHost,
    monitor: Option<MonitorSession>,
    record: Option<RecordSession>,
}

/// The capture engine's public face.
pub struct Recorder {
    state: tokio::sync::Mutex<RecorderState>,
    shared: Arc<EngineShared>,
    events: EventBus,
    disposed: AtomicBool,
}

impl Recorder {
    pub fn new() -> Self {
        let events = EventBus::new();
        Self {
            state: tokio::sync::Mutex::new(RecorderState {
                host: StreamHost::spawn(),
                monitor: None,
                record: None,
            }),
            shared: Arc::new(EngineShared::new(events.clone())),
            events,
            disposed: AtomicBool::new(false),
        }
    }

    /// Receive engine events. Multiple receivers share one event stream.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.is_recording()
    }

    pub fn mic_gain(&self) -> f32 {
        self.shared.mic_gain()
    }

    pub fn loopback_gain(&self) -> f32 {
        self.shared.loopback_gain()
    }

    pub fn set_mic_gain(&self, gain: f32) -> EngineResult<()> {
        self.ensure_live()?;
        Self::validate_gain(gain)?;
        self.shared.set_mic_gain(gain.clamp(0.0, MAX_GAIN));
        Ok(())
    }

    pub fn set_loopback_gain(&self, gain: f32) -> EngineResult<()> {
        self.ensure_live()?;
        Self::validate_gain(gain)?;
        self.shared.set_loopback_gain(gain.clamp(0.0, MAX_GAIN));
        Ok(())
    }

    fn validate_gain(gain: f32) -> EngineResult<()> {
        if gain.is_finite() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig("gain must be finite".into()))
        }
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.disposed.load(Ordering::Relaxed) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Open the devices and start metering. Idempotent for the same
    /// options; reconfigures (closing and reopening streams) otherwise.
    pub async fn monitor(&self, options: MonitorOptions) -> EngineResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;
        self.monitor_locked(&mut state, options).await
    }

    async fn monitor_locked(
        &self,
        state: &mut RecorderState,
        options: MonitorOptions,
    ) -> EngineResult<()> {
        if let Some(monitor) = &state.monitor {
            if monitor.options == options {
                return Ok(());
            }
            if state.record.is_some() {
                return Err(EngineError::RecordingInProgress);
            }
        }

        self.shared.reset_liveness();
        self.shared.ring.lock().clear();
        let opened = state
            .host
            .open(
                options.loopback_id.clone(),
                options.mic_id.clone(),
                self.shared.clone(),
            )
            .await;
        let canonical = match opened {
            Ok(canonical) => canonical,
            Err(e) => {
                // The host already dropped any previous streams before the
                // failed open; keeping the old session would let the
                // idempotent fast path report "monitoring" with no live
                // callbacks behind it.
                state.monitor = None;
                return Err(e);
            }
        };

        // Grace period: treat loopback as live until proven silent
        self.shared.touch_loopback();
        state.monitor = Some(MonitorSession { options, canonical });
        self.events.status(StatusKind::Info, "Monitoring started");
        Ok(())
    }

    /// Start a recording session. Ensures monitoring with the requested
    /// devices first, then opens the output files, the job queue, and the
    /// writer. Returns the selected output paths.
    pub async fn start(&self, options: RecordOptions) -> EngineResult<OutputPaths> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;
        if state.record.is_some() {
            return Err(EngineError::AlreadyRecording);
        }

        let bitrate = validate_bitrate(options.mp3_bitrate_kbps);
        self.monitor_locked(&mut state, options.monitor_options())
            .await?;
        let canonical = state
            .monitor
            .as_ref()
            .map(|m| m.canonical)
            .ok_or(EngineError::NotMonitoring)?;

        if let Some(parent) = options.output_base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let paths = select_output_paths(&options.output_base, bitrate > 0)?;

        let log = SessionLog::create(&paths.log)?;
        log.info(
            "session",
            &format!(
                "recording at {} Hz, {} ch; mp3 bitrate {}",
                canonical.sample_rate, canonical.channels, bitrate
            ),
        );
        log.info("session", &format!("system: {}", paths.system.display()));
        log.info("session", &format!("mic: {}", paths.mic.display()));
        log.info("session", &format!("mix: {}", paths.mix.display()));

        let files = WriterFiles::create(&paths.system, &paths.mic, &paths.mix, canonical)?;
        let capacity = writer::queue_capacity(canonical);
        let (tx, rx) = bounded(capacity);
        let fault: WriterFault = Arc::new(Mutex::new(None));
        let writer = writer::spawn_writer(rx, files, self.shared.clone(), fault.clone(), log.clone());
        log.info("session", &format!("job queue capacity {}", capacity));

        // No pre-session mic audio may reach the mix
        self.shared.ring.lock().clear();
        *self.shared.active.write() = Some(Arc::new(ActiveRecording::new(tx, log.clone())));
        self.shared.set_recording(true);

        state.record = Some(RecordSession {
            writer,
            fault,
            paths: paths.clone(),
            mp3_bitrate: bitrate,
            log,
        });

        self.events.status(StatusKind::Info, "Recording started");
        tracing::info!("recording started: {}", paths.system.display());
        Ok(paths)
    }

    /// Stop the current recording: drain the writer (30 s watchdog),
    /// observe the fault flag, run the MP3 pass if requested, and emit
    /// `Stopped` with the output paths. The engine returns to Monitoring.
    pub async fn stop(&self, cancel: CancelToken) -> EngineResult<OutputPaths> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;
        let Some(session) = state.record.take() else {
            return Err(EngineError::NotRecording);
        };
        let RecordSession {
            writer,
            fault,
            mut paths,
            mp3_bitrate,
            log,
        } = session;

        // Handlers stop enqueuing on their next callback
        self.shared.set_recording(false);
        let active = self.shared.active.write().take();
        if let Some(active) = &active {
            let dropped = active.dropped_blocks.load(Ordering::Relaxed);
            let underruns = active.underruns.load(Ordering::Relaxed);
            let peak_backlog = active.peak_backlog_samples.load(Ordering::Relaxed);
            log.info(
                "session",
                &format!(
                    "counters: dropped {} block(s), {} underrun(s), peak backlog {} sample(s)",
                    dropped, underruns, peak_backlog
                ),
            );
        }
        // Dropping the last persistent sender lets the writer drain out
        drop(active);

        join_writer(
            writer,
            WRITER_DRAIN_TIMEOUT,
            &log,
            "writer did not drain within 30s; proceeding",
        )
        .await;

        if let Some(fault) = fault.lock().take() {
            log.error("session", &fault);
            self.events
                .status(StatusKind::Error, format!("Disk writer failed: {}", fault));
        }

        let mut note = String::new();
        if mp3_bitrate > 0 {
            match self.encode_pass(&paths, mp3_bitrate, &log, &cancel).await {
                Ok(true) => {}
                Ok(false) => note = " (MP3 cancelled; partial file kept)".into(),
                Err(e) => {
                    note = format!(" (MP3 encoding failed: {})", e);
                    if let Some(mp3) = &paths.mp3 {
                        if !mp3.exists() {
                            paths.mp3 = None;
                        }
                    }
                }
            }
        }

        log.info("session", "stopped");
        log.close();
        self.events
            .stopped(format!("Recording stopped{}", note), paths.clone());
        tracing::info!("recording stopped");
        Ok(paths)
    }

    async fn encode_pass(
        &self,
        paths: &OutputPaths,
        bitrate: u32,
        log: &SessionLog,
        cancel: &CancelToken,
    ) -> EngineResult<bool> {
        let Some(mp3_path) = paths.mp3.clone() else {
            return Ok(true);
        };
        // A bare WAV header means nothing was captured; skip the pass
        let mix_len = std::fs::metadata(&paths.mix).map(|m| m.len()).unwrap_or(0);
        if mix_len <= 44 {
            log.info("encode", "mix file empty; skipping MP3");
            return Ok(true);
        }

        self.events.status(StatusKind::Encoding, "Encoding MP3");
        log.info("encode", "starting MP3 pass");

        let mix_path = paths.mix.clone();
        let events = self.events.clone();
        let cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            encoder::encode_mix(&mix_path, &mp3_path, bitrate, &cancel, &events)
        })
        .await
        .map_err(|e| EngineError::Encode(format!("encoder task failed: {}", e)))?;

        match &result {
            Ok(true) => log.info("encode", "finished"),
            Ok(false) => log.warn("encode", "cancelled; partial MP3 kept"),
            Err(e) => log.error("encode", &e.to_string()),
        }
        result
    }

    /// Close the devices and return to Idle. Fails while recording.
    pub async fn stop_monitor(&self) -> EngineResult<()> {
        self.ensure_live()?;
        let mut state = self.state.lock().await;
        if state.record.is_some() {
            return Err(EngineError::RecordingInProgress);
        }
        if state.monitor.take().is_some() {
            state.host.close().await;
            self.events.status(StatusKind::Info, "Monitoring stopped");
        }
        Ok(())
    }

    /// Idempotent full teardown. Safe after `stop` or instead of it.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock().await;

        self.shared.set_recording(false);
        drop(self.shared.active.write().take());

        // Device subscriptions go down before file handles
        state.monitor = None;
        state.host.close().await;

        if let Some(session) = state.record.take() {
            join_writer(
                session.writer,
                DISPOSE_DRAIN_TIMEOUT,
                &session.log,
                "writer still draining at dispose; detaching",
            )
            .await;
            session.log.close();
        }

        state.host.shutdown();
        tracing::debug!("recorder disposed");
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

async fn join_writer(
    writer: JoinHandle<()>,
    limit: Duration,
    log: &SessionLog,
    timeout_msg: &str,
) {
    let join = tokio::task::spawn_blocking(move || writer.join());
    match tokio::time::timeout(limit, join).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(_))) => {
            log.error("session", "writer thread panicked");
            tracing::error!("writer thread panicked");
        }
        Ok(Err(e)) => {
            log.error("session", &format!("writer join failed: {}", e));
        }
        Err(_) => {
            log.warn("session", timeout_msg);
            tracing::warn!("{}", timeout_msg);
        }
    }
}

fn validate_bitrate(kbps: u32) -> u32 {
    if kbps == 0 {
        0
    } else {
        kbps.clamp(64, 320)
    }
}

/// Choose collision-free output paths by suffixing ` (N)` before each
/// extension, with one N shared by the whole session so the artifacts
/// stay visibly grouped.
fn select_output_paths(base: &Path, with_mp3: bool) -> EngineResult<OutputPaths> {
    let stem = base
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidConfig("output base path has no file name".into()))?;
    if base.as_os_str().len() > 1024 {
        return Err(EngineError::InvalidConfig("output path too long".into()));
    }
    let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();

    for n in 0..MAX_PATH_PROBES {
        let suffix = if n == 0 {
            String::new()
        } else {
            format!(" ({})", n)
        };
        let candidate = OutputPaths {
            system: dir.join(format!("{}{}-system.wav", stem, suffix)),
            mic: dir.join(format!("{}{}-mic.wav", stem, suffix)),
            mix: dir.join(format!("{}{}-mix.wav", stem, suffix)),
            mp3: with_mp3.then(|| dir.join(format!("{}{}.mp3", stem, suffix))),
            log: dir.join(format!("{}{}.txt", stem, suffix)),
        };
        let collision = candidate.system.exists()
            || candidate.mic.exists()
            || candidate.mix.exists()
            || candidate.log.exists()
            || candidate.mp3.as_ref().is_some_and(|p| p.exists());
        if !collision {
            return Ok(candidate);
        }
    }
    Err(EngineError::InvalidConfig(
        "could not find a free output path".into(),
    ))
}
