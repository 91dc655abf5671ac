//! Stream host
//!
//! `cpal::Stream` is `!Send`, so both capture streams live on a dedicated
//! host thread that executes open/close commands from a channel and
//! replies over oneshots. Callers (including UI threads) only await the
//! reply; the 250 ms open-retry backoff sleeps on the host thread, never
//! on the caller.
//!
//! The loopback stream defines the canonical format for the whole
//! monitoring session. Both devices may deliver f32 or i16 samples; i16
//! input is widened into a reusable scratch buffer inside the callback.

use crate::device;
use crate::dsp::Format;
use crate::error::{EngineError, EngineResult};
use crate::events::StatusKind;
use crate::loopback::LoopbackHandler;
use crate::mic::MicHandler;
use crate::shared::EngineShared;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, SupportedStreamConfig};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) struct OpenRequest {
    pub loopback_id: Option<String>,
    pub mic_id: Option<String>,
    pub shared: Arc<EngineShared>,
    pub reply: oneshot::Sender<EngineResult<Format>>,
}

enum HostCmd {
    Open(Box<OpenRequest>),
    Close(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the stream-host thread.
pub(crate) struct StreamHost {
    tx: Sender<HostCmd>,
    handle: Option<JoinHandle<()>>,
}

impl StreamHost {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("stream-host".into())
            .spawn(move || run_host(rx))
            .expect("failed to spawn stream host thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Open (or replace) the monitoring streams; resolves to the canonical
    /// format taken from the loopback device.
    pub(crate) async fn open(
        &self,
        loopback_id: Option<String>,
        mic_id: Option<String>,
        shared: Arc<EngineShared>,
    ) -> EngineResult<Format> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HostCmd::Open(Box::new(OpenRequest {
                loopback_id,
                mic_id,
                shared,
                reply,
            })))
            .map_err(|_| EngineError::Stream("stream host is gone".into()))?;
        rx.await
            .map_err(|_| EngineError::Stream("stream host is gone".into()))?
    }

    /// Drop both streams (stops the device callbacks).
    pub(crate) async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(HostCmd::Close(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Tear the host thread down; used by dispose.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.tx.send(HostCmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamHost {
    fn drop(&mut self) {
        let _ = self.tx.send(HostCmd::Shutdown);
    }
}

fn run_host(rx: Receiver<HostCmd>) {
    // Streams are owned here and only here
    let mut streams: Option<(Stream, Stream)> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            HostCmd::Open(req) => {
                streams = None;
                match open_streams(&req) {
                    Ok((loopback, mic, canonical)) => {
                        streams = Some((loopback, mic));
                        let _ = req.reply.send(Ok(canonical));
                    }
                    Err(e) => {
                        let _ = req.reply.send(Err(e));
                    }
                }
            }
            HostCmd::Close(reply) => {
                streams = None;
                let _ = reply.send(());
            }
            HostCmd::Shutdown => break,
        }
    }
    drop(streams);
    tracing::debug!("stream host exited");
}

struct OpenError {
    error: EngineError,
    transient: bool,
}

impl OpenError {
    fn fatal(error: EngineError) -> Self {
        Self {
            error,
            transient: false,
        }
    }
}

fn open_streams(req: &OpenRequest) -> EngineResult<(Stream, Stream, Format)> {
    let loopback_dev = device::resolve_loopback_device(req.loopback_id.as_deref())?;
    let mic_dev = device::resolve_mic_device(req.mic_id.as_deref())?;

    // The platform occasionally reports a just-enumerated device as not
    // ready; retry before giving up.
    let mut attempt = 1;
    let (loopback_stream, canonical) = loop {
        match try_open_loopback(&loopback_dev, req.shared.clone()) {
            Ok(opened) => break opened,
            Err(e) if e.transient && attempt < OPEN_ATTEMPTS => {
                tracing::warn!(
                    "loopback open attempt {}/{} failed: {}; retrying",
                    attempt,
                    OPEN_ATTEMPTS,
                    e.error
                );
                attempt += 1;
                std::thread::sleep(OPEN_BACKOFF);
            }
            Err(e) => return Err(e.error),
        }
    };

    let mic_config = mic_dev
        .default_input_config()
        .map_err(|e| EngineError::StreamOpen(format!("mic config: {}", e)))?;
    let source = Format::new(mic_config.sample_rate(), mic_config.channels() as usize);
    let mut mic_handler = MicHandler::new(req.shared.clone(), source, canonical);
    let mic_stream = build_capture_stream(&mic_dev, mic_config, req.shared.clone(), move |data| {
        mic_handler.on_block(data)
    })
    .map_err(|e| e.error)?;

    loopback_stream
        .play()
        .map_err(|e| EngineError::StreamOpen(format!("loopback play: {}", e)))?;
    mic_stream
        .play()
        .map_err(|e| EngineError::StreamOpen(format!("mic play: {}", e)))?;

    tracing::info!(
        "monitoring at {} Hz, {} ch (loopback-defined)",
        canonical.sample_rate,
        canonical.channels
    );
    Ok((loopback_stream, mic_stream, canonical))
}

fn try_open_loopback(
    device: &cpal::Device,
    shared: Arc<EngineShared>,
) -> Result<(Stream, Format), OpenError> {
    let config = device.default_input_config().map_err(|e| OpenError {
        transient: matches!(e, cpal::DefaultStreamConfigError::DeviceNotAvailable),
        error: EngineError::StreamOpen(format!("loopback config: {}", e)),
    })?;

    let canonical = Format::new(config.sample_rate(), config.channels() as usize);
    if canonical.channels == 0 || canonical.channels > 2 {
        return Err(OpenError::fatal(EngineError::StreamOpen(format!(
            "loopback device has {} channels; only mono and stereo are supported",
            canonical.channels
        ))));
    }

    let mut handler = LoopbackHandler::new(shared.clone(), canonical);
    let stream = build_capture_stream(device, config, shared, move |data| handler.on_block(data))?;
    Ok((stream, canonical))
}

/// Build an input stream feeding `on_block` with f32 samples in the
/// device's native layout.
fn build_capture_stream(
    device: &cpal::Device,
    config: SupportedStreamConfig,
    shared: Arc<EngineShared>,
    mut on_block: impl FnMut(&[f32]) + Send + 'static,
) -> Result<Stream, OpenError> {
    let err_fn = {
        let shared = shared.clone();
        move |err: cpal::StreamError| {
            tracing::error!("audio stream error: {}", err);
            shared
                .events
                .status(StatusKind::Error, format!("Audio stream error: {}", err));
            // Stop feeding the writer; the host application decides whether
            // to stop or re-monitor.
            shared.set_recording(false);
        }
    };

    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    let built = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| on_block(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => {
            let mut widened: Vec<f32> = Vec::new();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    widened.resize(data.len(), 0.0);
                    for (dst, &s) in widened.iter_mut().zip(data) {
                        *dst = s as f32 / 32768.0;
                    }
                    on_block(&widened);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(OpenError::fatal(EngineError::StreamOpen(format!(
                "unsupported sample format: {:?}",
                other
            ))))
        }
    };

    built.map_err(|e| OpenError {
        transient: matches!(e, cpal::BuildStreamError::DeviceNotAvailable),
        error: EngineError::StreamOpen(e.to_string()),
    })
}
