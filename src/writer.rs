//! Background disk writer
//!
//! A dedicated thread drains the bounded job queue and writes each block
//! to the WAV file selected by the job's target. The writer owns all
//! three file handles exclusively; nothing else touches them. When every
//! producer has hung up and the queue is drained, the writer finalizes
//! the WAV headers and exits. The first fatal write error is recorded in
//! the writer-fault flag, recording is flipped off so the handlers stop
//! enqueuing, and the remaining jobs are still drained so their buffers
//! make it back to the pool.

use crate::dsp::Format;
use crate::events::StatusKind;
use crate::session_log::SessionLog;
use crate::shared::EngineShared;
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Which output file a job belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    System,
    Mic,
    Mix,
}

/// One quantized block on its way to disk. `bytes` is rented from the
/// pool; ownership transfers to the writer, which returns it after the
/// write (or immediately, if the enqueue fails).
pub struct Job {
    pub target: Target,
    pub bytes: Vec<u8>,
    pub len: usize,
}

/// First fatal writer error, observed by the controller at stop time
pub(crate) type WriterFault = Arc<Mutex<Option<String>>>;

/// Queue capacity for ~10 seconds of audio at the canonical format,
/// assuming ~480-sample jobs (one 10 ms block at 48 kHz mono), clamped
/// to a sane range.
pub fn queue_capacity(format: Format) -> usize {
    let samples_per_10s = format.sample_rate as usize * format.channels * 10;
    (samples_per_10s / 480).clamp(2000, 10_000)
}

type WavOut = WavWriter<BufWriter<File>>;

pub(crate) struct WriterFiles {
    system: WavOut,
    mic: WavOut,
    mix: WavOut,
}

impl WriterFiles {
    /// Create the three session outputs: 16-bit system and mic, 32-bit mix,
    /// all at the canonical rate and channel count.
    pub(crate) fn create(
        system_path: &Path,
        mic_path: &Path,
        mix_path: &Path,
        format: Format,
    ) -> Result<Self, hound::Error> {
        let spec16 = WavSpec {
            channels: format.channels as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let spec32 = WavSpec {
            bits_per_sample: 32,
            ..spec16
        };
        Ok(Self {
            system: WavWriter::create(system_path, spec16)?,
            mic: WavWriter::create(mic_path, spec16)?,
            mix: WavWriter::create(mix_path, spec32)?,
        })
    }

    fn write_job(&mut self, job: &Job) -> Result<()> {
        let bytes = &job.bytes[..job.len];
        match job.target {
            Target::System => write_i16(&mut self.system, bytes).context("system write"),
            Target::Mic => write_i16(&mut self.mic, bytes).context("mic write"),
            Target::Mix => write_i32(&mut self.mix, bytes).context("mix write"),
        }
    }

    fn finalize(self) -> Result<(), hound::Error> {
        self.system.finalize()?;
        self.mic.finalize()?;
        self.mix.finalize()?;
        Ok(())
    }
}

fn write_i16(writer: &mut WavOut, bytes: &[u8]) -> Result<(), hound::Error> {
    for chunk in bytes.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    Ok(())
}

fn write_i32(writer: &mut WavOut, bytes: &[u8]) -> Result<(), hound::Error> {
    for chunk in bytes.chunks_exact(4) {
        writer.write_sample(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))?;
    }
    Ok(())
}

/// Spawn the writer thread. It exits once every queue sender is dropped
/// and the queue is drained.
pub(crate) fn spawn_writer(
    rx: Receiver<Job>,
    files: WriterFiles,
    shared: Arc<EngineShared>,
    fault: WriterFault,
    log: SessionLog,
) -> JoinHandle<()> {
    std::thread::spawn(move || run_writer(rx, files, shared, fault, log))
}

fn run_writer(
    rx: Receiver<Job>,
    files: WriterFiles,
    shared: Arc<EngineShared>,
    fault: WriterFault,
    log: SessionLog,
) {
    let mut files = Some(files);
    let mut jobs_written: u64 = 0;

    for job in rx.iter() {
        if let Some(f) = files.as_mut() {
            match f.write_job(&job) {
                Ok(()) => jobs_written += 1,
                Err(e) => {
                    record_fault(&fault, &shared, &log, &format!("{:#}", e));
                    // Keep draining so every rented buffer is returned,
                    // but stop touching the files.
                    files = None;
                }
            }
        }
        shared.pool.give_back(job.bytes);
    }

    if let Some(f) = files.take() {
        if let Err(e) = f.finalize() {
            record_fault(&fault, &shared, &log, &format!("finalize: {}", e));
        }
    }

    log.info("writer", &format!("exited after {} blocks", jobs_written));
    tracing::debug!("disk writer exited after {} blocks", jobs_written);
}

fn record_fault(fault: &WriterFault, shared: &EngineShared, log: &SessionLog, message: &str) {
    let mut guard = fault.lock();
    if guard.is_none() {
        *guard = Some(message.to_string());
        shared.set_recording(false);
        shared
            .events
            .status(StatusKind::Error, format!("Disk writer failed: {}", message));
        log.error("writer", message);
        tracing::error!("disk writer fault: {}", message);
    }
}
