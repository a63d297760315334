//! Audio device output using cpal
//!
//! The playback loop pushes chunks into an SPSC ring buffer; the cpal
//! callback drains it on the real-time audio thread, applying master volume
//! and substituting silence on underrun. Pushing blocks when the ring is
//! full, which is the engine's backpressure: the loop naturally runs at the
//! device's consumption rate.
//!
//! The [`AudioSink`] trait is the seam between the engine and the device so
//! tests can run the full state machine against [`MemorySink`] without audio
//! hardware.

use crate::audio::chunk::PcmChunk;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default ring capacity in frames (~190 ms at the engine rate).
pub const DEFAULT_BUFFER_FRAMES: usize = 8192;

/// Destination for decoded audio.
///
/// `write` blocks until the sink has accepted the whole chunk; this is the
/// only backpressure mechanism between the playback loop and the device.
pub trait AudioSink: Send {
    /// Write one chunk, blocking while the sink is full.
    fn write(&mut self, chunk: &PcmChunk) -> Result<()>;

    /// Set master volume (0.0 to 1.0, applied at output time).
    fn set_volume(&self, volume: f32);

    /// Current master volume.
    fn volume(&self) -> f32;
}

/// Real audio device sink.
///
/// The cpal stream is owned by a dedicated thread because streams are not
/// `Send` on every backend; the sink half holds only the ring producer and
/// shared flags.
pub struct CpalSink {
    producer: ringbuf::HeapProd<f32>,
    volume: Arc<Mutex<f32>>,
    error_flag: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    _stream_thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open an output device and start its stream.
    ///
    /// `device_name` of `None` uses the default device; a named device that
    /// cannot be found falls back to the default with a warning.
    pub fn new(device_name: Option<String>, buffer_frames: Option<usize>) -> Result<Self> {
        let capacity = buffer_frames.unwrap_or(DEFAULT_BUFFER_FRAMES) * 2;
        let ring = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = ring.split();

        let volume = Arc::new(Mutex::new(1.0f32));
        let error_flag = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (startup_tx, startup_rx) = mpsc::channel::<Result<()>>();
        let thread_volume = Arc::clone(&volume);
        let thread_error = Arc::clone(&error_flag);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match build_stream(
                    device_name,
                    consumer,
                    thread_volume,
                    Arc::clone(&thread_error),
                ) {
                    Ok(stream) => {
                        let _ = startup_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = startup_tx.send(Err(e));
                        return;
                    }
                };
                // Keep the stream alive until the sink is dropped
                while !thread_shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn audio thread: {}", e)))?;

        startup_rx
            .recv()
            .map_err(|_| Error::AudioOutput("Audio thread died during startup".into()))??;

        Ok(Self {
            producer,
            volume,
            error_flag,
            shutdown,
            _stream_thread: Some(handle),
        })
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, chunk: &PcmChunk) -> Result<()> {
        push_with_retry(&mut self.producer, &self.error_flag, &chunk.samples)
    }

    fn set_volume(&self, volume: f32) {
        if let Ok(mut v) = self.volume.lock() {
            *v = volume.clamp(0.0, 1.0);
        }
    }

    fn volume(&self) -> f32 {
        self.volume.lock().map(|v| *v).unwrap_or(1.0)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Push samples into the ring, blocking while it is full.
///
/// A stream error observed mid-write is retried once from where the write
/// left off; a second error during the same write is fatal.
fn push_with_retry(
    producer: &mut ringbuf::HeapProd<f32>,
    error_flag: &AtomicBool,
    samples: &[f32],
) -> Result<()> {
    let mut written = 0;
    let mut retried = false;
    while written < samples.len() {
        if error_flag.swap(false, Ordering::Relaxed) {
            if retried {
                return Err(Error::AudioOutput(
                    "Audio stream failed again after retry".into(),
                ));
            }
            warn!("Audio stream reported an error, retrying write");
            retried = true;
            continue;
        }
        written += producer.push_slice(&samples[written..]);
        if written < samples.len() {
            // Ring full: wait for the callback to drain some
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Ok(())
}

/// Open the device and build a running output stream feeding from the ring.
fn build_stream(
    device_name: Option<String>,
    consumer: ringbuf::HeapCons<f32>,
    volume: Arc<Mutex<f32>>,
    error_flag: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => {
            let found = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().ok().as_deref() == Some(name.as_str()));
            match found {
                Some(dev) => {
                    info!("Using requested audio device: {}", name);
                    dev
                }
                None => {
                    warn!("Device '{}' not found, falling back to default", name);
                    host.default_output_device().ok_or_else(|| {
                        Error::AudioOutput(format!(
                            "Device '{}' not found and no default device available",
                            name
                        ))
                    })?
                }
            }
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No default output device found".into()))?,
    };

    let (config, sample_format) = best_config(&device)?;
    debug!(
        "Audio config: sample_rate={}, channels={}, format={:?}",
        config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => stream_for::<f32>(&device, &config, consumer, volume, error_flag)?,
        SampleFormat::I16 => stream_for::<i16>(&device, &config, consumer, volume, error_flag)?,
        SampleFormat::U16 => stream_for::<u16>(&device, &config, consumer, volume, error_flag)?,
        other => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;
    Ok(stream)
}

/// Prefer 44.1kHz stereo f32, matching the internal format; otherwise take
/// the device default.
fn best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
    let mut supported = device
        .supported_output_configs()
        .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?;

    let preferred = supported.find(|config| {
        config.channels() == 2
            && config.min_sample_rate().0 <= 44100
            && config.max_sample_rate().0 >= 44100
            && config.sample_format() == SampleFormat::F32
    });

    if let Some(config) = preferred {
        let sample_format = config.sample_format();
        let config = config.with_sample_rate(cpal::SampleRate(44100)).config();
        return Ok((config, sample_format));
    }

    let default = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;
    let sample_format = default.sample_format();
    Ok((default.config(), sample_format))
}

fn stream_for<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: ringbuf::HeapCons<f32>,
    volume: Arc<Mutex<f32>>,
    error_flag: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let err_flag = Arc::clone(&error_flag);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let vol = volume.lock().map(|v| *v).unwrap_or(1.0);
                for out in data.iter_mut() {
                    // Underrun yields silence, never a crash
                    let sample = consumer.try_pop().unwrap_or(0.0) * vol;
                    *out = T::from_sample(sample);
                }
            },
            move |e| {
                warn!("Audio stream error: {}", e);
                err_flag.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
}

/// In-memory sink for tests: records everything written, with the master
/// volume applied the way the device callback would.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Vec<f32>,
    chunks_written: usize,
    volume: Mutex<f32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            chunks_written: 0,
            volume: Mutex::new(1.0),
        }
    }

    /// All samples written so far, volume applied.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of chunks accepted.
    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> usize {
        self.samples.len() / 2
    }
}

impl AudioSink for MemorySink {
    fn write(&mut self, chunk: &PcmChunk) -> Result<()> {
        let vol = self.volume();
        self.samples.extend(chunk.samples.iter().map(|s| s * vol));
        self.chunks_written += 1;
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        if let Ok(mut v) = self.volume.lock() {
            *v = volume.clamp(0.0, 1.0);
        }
    }

    fn volume(&self) -> f32 {
        self.volume.lock().map(|v| *v).unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_samples() {
        let mut sink = MemorySink::new();
        let chunk = PcmChunk::new(vec![0.5, -0.5, 0.25, -0.25], 44100, 2).unwrap();
        sink.write(&chunk).unwrap();
        assert_eq!(sink.samples(), &[0.5, -0.5, 0.25, -0.25]);
        assert_eq!(sink.chunks_written(), 1);
        assert_eq!(sink.frames_written(), 2);
    }

    #[test]
    fn test_memory_sink_applies_volume() {
        let mut sink = MemorySink::new();
        sink.set_volume(0.5);
        let chunk = PcmChunk::new(vec![1.0, -1.0], 44100, 2).unwrap();
        sink.write(&chunk).unwrap();
        assert_eq!(sink.samples(), &[0.5, -0.5]);
    }

    #[test]
    fn test_write_retries_once_after_stream_error() {
        let ring = HeapRb::<f32>::new(8);
        let (mut producer, _consumer) = ring.split();
        let flag = AtomicBool::new(true);
        let samples = [0.1f32; 4];
        push_with_retry(&mut producer, &flag, &samples).unwrap();
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_second_stream_error_is_fatal() {
        let ring = HeapRb::<f32>::new(2);
        let (mut producer, _consumer) = ring.split();
        let flag = Arc::new(AtomicBool::new(true));
        let setter = Arc::clone(&flag);
        // The error callback keeps flagging; nobody drains the ring, so the
        // write cannot finish and must observe the second error
        let handle = std::thread::spawn(move || {
            for _ in 0..200 {
                setter.store(true, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let samples = [0.1f32; 8];
        let result = push_with_retry(&mut producer, &flag, &samples);
        handle.join().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_volume_clamped() {
        let sink = MemorySink::new();
        sink.set_volume(3.0);
        assert_eq!(sink.volume(), 1.0);
        sink.set_volume(-1.0);
        assert_eq!(sink.volume(), 0.0);
    }
}
