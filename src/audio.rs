use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::media::Sample as MediaSample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::MediaConstraints;
use crate::error::{Error, Result};
use crate::media::{Capture, CaptureHandle, LocalMedia, MediaDevices, MediaKind};

const PCMU_RATE: u32 = 8000;
/// 20 ms of audio at 8 kHz.
const PCMU_FRAME: usize = 160;

/// Default system devices: the microphone through cpal. There is no camera
/// backend, so video must come from an application-supplied `MediaDevices`.
#[derive(Default)]
pub struct SystemDevices;

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn open(&self, constraints: MediaConstraints) -> Result<Capture> {
        if constraints.video {
            return Err(Error::DeviceUnavailable(
                "no camera capture backend; request audio only".to_string(),
            ));
        }
        let media = LocalMedia::with_constraints(
            format!("meshcall-{}", uuid::Uuid::new_v4()),
            constraints,
        );
        let handle: Box<dyn CaptureHandle> = match media.track(MediaKind::Audio) {
            Some(audio) => Box::new(AudioCapture::start(media.clone(), audio.track.clone()).await?),
            None => Box::new(NoCapture),
        };
        Ok(Capture { media, handle })
    }
}

struct NoCapture;

impl CaptureHandle for NoCapture {
    fn stop(&mut self) {}
}

/// Microphone capture. The cpal stream lives on its own thread because it
/// is not `Send`; samples cross over a bounded channel and are pumped into
/// the local audio track.
pub struct AudioCapture {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub async fn start(media: LocalMedia, track: Arc<TrackLocalStaticSample>) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(u32, u16)>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (sample_tx, sample_rx) = mpsc::channel::<Vec<f32>>(64);

        std::thread::Builder::new()
            .name("meshcall-mic".to_owned())
            .spawn(move || {
                let stream = match open_input(sample_tx) {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until stop() or until the sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("microphone stream closed");
            })?;

        let (rate, channels) = ready_rx
            .await
            .map_err(|_| Error::DeviceUnavailable("capture thread exited".to_string()))??;
        debug!(rate, channels, "microphone stream started");

        let packetizer = match PcmuPacketizer::new(rate, channels) {
            Ok(packetizer) => packetizer,
            Err(e) => {
                let _ = stop_tx.send(());
                return Err(e);
            }
        };
        let pump = tokio::spawn(pump_samples(sample_rx, track, media, packetizer));

        Ok(Self {
            stop_tx: Some(stop_tx),
            pump: Some(pump),
        })
    }
}

impl CaptureHandle for AudioCapture {
    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(sample_tx: mpsc::Sender<Vec<f32>>) -> Result<(cpal::Stream, u32, u16)> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let config = input_device.default_input_config().map_err(device_error)?;
    let rate = config.sample_rate().0;
    let channels = config.channels();

    let input_stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&input_device, &config.into(), sample_tx)?,
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &config.into(), sample_tx)?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &config.into(), sample_tx)?,
        sample_format => {
            return Err(Error::DeviceUnavailable(format!(
                "unsupported sample format: {:?}",
                sample_format
            )))
        }
    };

    input_stream.play().map_err(device_error)?;
    Ok((input_stream, rate, channels))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_tx: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err: cpal::StreamError| warn!(error = %err, "input audio stream error");

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| (*s).to_sample::<f32>()).collect();
                // Never block the audio thread; a full queue drops the buffer.
                let _ = sample_tx.try_send(samples);
            },
            err_fn,
            None,
        )
        .map_err(device_error)
}

/// cpal reports OS permission refusals as backend errors; tell them apart
/// from a missing device by their description.
fn device_error(err: impl Display) -> Error {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        Error::PermissionDenied(msg)
    } else {
        Error::DeviceUnavailable(msg)
    }
}

async fn pump_samples(
    mut rx: mpsc::Receiver<Vec<f32>>,
    track: Arc<TrackLocalStaticSample>,
    media: LocalMedia,
    mut packetizer: PcmuPacketizer,
) {
    while let Some(samples) = rx.recv().await {
        if !media.is_live() {
            break;
        }
        if !media.is_audio_enabled() {
            continue;
        }
        for frame in packetizer.push(&samples) {
            let sample = MediaSample {
                data: frame,
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(error = %e, "dropping audio frame");
            }
        }
    }
}

/// Mixes interleaved float PCM down to mono 8 kHz and encodes it as
/// G.711 mu-law in 20 ms frames.
pub struct PcmuPacketizer {
    channels: usize,
    step: f64,
    phase: f64,
    sum: f32,
    count: u32,
    pending: Vec<u8>,
}

impl PcmuPacketizer {
    /// Fails for inputs below 8 kHz, which would need upsampling.
    pub fn new(input_rate: u32, channels: u16) -> Result<Self> {
        if input_rate < PCMU_RATE {
            return Err(Error::DeviceUnavailable(format!(
                "microphone rate {} Hz is below {} Hz",
                input_rate, PCMU_RATE
            )));
        }
        Ok(Self {
            channels: channels.max(1) as usize,
            step: input_rate as f64 / PCMU_RATE as f64,
            phase: 0.0,
            sum: 0.0,
            count: 0,
            pending: Vec::with_capacity(PCMU_FRAME),
        })
    }

    pub fn push(&mut self, interleaved: &[f32]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for chunk in interleaved.chunks(self.channels) {
            let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.sum += mono;
            self.count += 1;
            self.phase += 1.0;
            if self.phase >= self.step {
                self.phase -= self.step;
                let avg = self.sum / self.count as f32;
                self.sum = 0.0;
                self.count = 0;
                self.pending.push(linear_to_ulaw(i16::from_sample(avg)));
                if self.pending.len() == PCMU_FRAME {
                    let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(PCMU_FRAME));
                    frames.push(Bytes::from(frame));
                }
            }
        }
        frames
    }
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}
