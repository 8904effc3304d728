//! Microphone capture using CPAL
//!
//! `CpalMicrophone` opens the default input device at its native config, downmixes to mono
//! and forwards sample batches over a channel. The cpal `Stream` is `!Send` on some
//! platforms, so it lives on a dedicated thread for as long as the microphone is open.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exclusive access to a capture device.
///
/// `open` either succeeds fully or leaves nothing acquired. `close` is idempotent.
pub trait MicrophoneSource {
    /// Acquire the device. Failures are `VoiceError::Permission`.
    fn open(&mut self) -> VoiceResult<()>;

    /// Mono samples captured since the last read. Device faults are `VoiceError::Capture`.
    fn read(&mut self) -> VoiceResult<Vec<f32>>;

    /// Release the device.
    fn close(&mut self);

    /// Rate of the samples returned by `read`.
    fn sample_rate(&self) -> u32;

    fn is_open(&self) -> bool;
}

/// Message from the capture callback
#[derive(Debug)]
enum CaptureMessage {
    Samples(Vec<f32>),
    Fault(String),
}

/// Live capture thread and the channel it feeds.
struct CaptureHandle {
    samples_rx: mpsc::UnboundedReceiver<CaptureMessage>,
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// Default input device via CPAL.
pub struct CpalMicrophone {
    device_name: Option<String>,
    sample_rate: u32,
    capture: Option<CaptureHandle>,
}

impl CpalMicrophone {
    /// Use the host's default input device.
    pub fn new() -> Self {
        Self {
            device_name: None,
            sample_rate: 0,
            capture: None,
        }
    }

    /// Use the input device with this exact name.
    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
            sample_rate: 0,
            capture: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&mut self) -> VoiceResult<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<u32>>();
        let device_name = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("avatar-mic".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), samples_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until close() or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone: capture thread exiting");
            })?;

        let rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoiceError::Permission("capture thread exited during setup".to_string()));
            }
        };

        self.sample_rate = rate;
        self.capture = Some(CaptureHandle {
            samples_rx,
            stop_tx,
            thread: Some(thread),
        });
        info!("🎤 Microphone open ({}Hz mono)", rate);
        Ok(())
    }

    fn read(&mut self) -> VoiceResult<Vec<f32>> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(Vec::new());
        };
        let mut samples = Vec::new();
        while let Ok(message) = capture.samples_rx.try_recv() {
            match message {
                CaptureMessage::Samples(batch) => samples.extend(batch),
                CaptureMessage::Fault(reason) => return Err(VoiceError::Capture(reason)),
            }
        }
        Ok(samples)
    }

    fn close(&mut self) {
        let Some(mut capture) = self.capture.take() else {
            return;
        };
        let _ = capture.stop_tx.send(());
        if let Some(thread) = capture.thread.take() {
            if thread.join().is_err() {
                warn!("Microphone: capture thread panicked");
            }
        }
        info!("🎤 Microphone released");
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_stream(
    device_name: Option<&str>,
    samples_tx: mpsc::UnboundedSender<CaptureMessage>,
) -> VoiceResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_name {
        None => host.default_input_device(),
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
    }
    .ok_or_else(|| VoiceError::Permission("No input device available".to_string()))?;

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, samples_tx)?,
        SampleFormat::I16 => input_stream::<i16>(&device, &config, samples_tx)?,
        SampleFormat::U16 => input_stream::<u16>(&device, &config, samples_tx)?,
        other => {
            return Err(VoiceError::Permission(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    Ok((stream, rate))
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples_tx: mpsc::UnboundedSender<CaptureMessage>,
) -> VoiceResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let fault_tx = samples_tx.clone();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono = downmix(data, channels);
            let _ = samples_tx.send(CaptureMessage::Samples(mono));
        },
        move |err| {
            warn!("Audio stream error: {}", err);
            let _ = fault_tx.send(CaptureMessage::Fault(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

/// Average interleaved frames into mono f32.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo_f32() {
        let mono = downmix(&[0.5f32, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_downmix_i16_is_normalized() {
        let mono = downmix(&[i16::MAX, i16::MAX], 1);
        assert!(mono.iter().all(|s| (s - 1.0).abs() < 1e-3));
    }

    #[test]
    fn test_closed_microphone_reads_nothing() {
        let mut mic = CpalMicrophone::new();
        assert!(!mic.is_open());
        assert!(mic.read().unwrap().is_empty());
        mic.close();
        mic.close();
    }

    #[test]
    fn test_list_devices() {
        // No audio hardware in CI is fine.
        if let Ok(devices) = CpalMicrophone::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
