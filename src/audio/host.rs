//! System audio through CPAL
//!
//! cpal streams are not `Send` on every platform, so each stream is built and
//! owned by its own thread; the track/output handle only keeps a stop signal.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use futures_util::future::BoxFuture;

use super::capture::{f32_to_pcm16, AudioFrame, AudioTrack, FrameSender};
use super::playback::{AudioOutput, PlaybackSource};
use crate::devices::{DeviceKind, MediaDeviceInfo, MediaDevices};
use crate::error::{CaptureError, DeviceError, PlaybackError};

/// Device inventory and streams from the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn find_device(kind: DeviceKind, device: Option<&MediaDeviceInfo>) -> Result<Device, DeviceError> {
    let host = cpal::default_host();

    let Some(wanted) = device else {
        let default = match kind {
            DeviceKind::AudioOutput => host.default_output_device(),
            _ => host.default_input_device(),
        };
        return default.ok_or_else(|| DeviceError::Unavailable("no default device".to_string()));
    };

    let mut candidates = match kind {
        DeviceKind::AudioOutput => host.output_devices(),
        _ => host.input_devices(),
    }
    .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

    candidates
        .find(|d| d.name().map(|n| n == wanted.device_id).unwrap_or(false))
        .ok_or_else(|| DeviceError::NotFound(wanted.device_id.clone()))
}

impl MediaDevices for CpalDevices {
    fn enumerate(&self) -> BoxFuture<'static, Result<Vec<MediaDeviceInfo>, DeviceError>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(|| {
                let host = cpal::default_host();
                let mut out = Vec::new();

                let inputs = host
                    .input_devices()
                    .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
                for device in inputs {
                    if let Ok(name) = device.name() {
                        out.push(MediaDeviceInfo::new(name.clone(), name, DeviceKind::AudioInput));
                    }
                }

                let outputs = host
                    .output_devices()
                    .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
                for device in outputs {
                    if let Ok(name) = device.name() {
                        out.push(MediaDeviceInfo::new(name.clone(), name, DeviceKind::AudioOutput));
                    }
                }
                Ok(out)
            })
            .await
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?
        })
    }

    fn open_microphone(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioTrack>, DeviceError> {
        let found = find_device(DeviceKind::AudioInput, device)?;
        let name = found.name().unwrap_or_else(|_| "microphone".to_string());
        Ok(Box::new(CpalMicrophone::new(name, device.cloned())))
    }

    fn open_speaker(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        let found = find_device(DeviceKind::AudioOutput, device)?;
        let name = found.name().unwrap_or_else(|_| "speaker".to_string());
        Ok(Box::new(CpalSpeaker::new(name, device.cloned())))
    }
}

/// Stream thread plus its stop signal
struct StreamThread {
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamThread {
    /// Build a stream on a fresh thread and keep it alive until stopped
    fn spawn<F>(name: &str, build: F) -> Result<Self, String>
    where
        F: FnOnce() -> Result<Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|s| {
                    s.play().map_err(|e| format!("Failed to start stream: {}", e))?;
                    Ok(s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until stop() or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| e.to_string())?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop, thread }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err("stream thread exited".to_string()),
        }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            log::warn!("Audio stream thread panicked");
        }
    }
}

/// Microphone capture track
pub struct CpalMicrophone {
    id: String,
    device: Option<MediaDeviceInfo>,
    stream: Option<StreamThread>,
}

impl CpalMicrophone {
    fn new(id: String, device: Option<MediaDeviceInfo>) -> Self {
        Self {
            id,
            device,
            stream: None,
        }
    }
}

fn build_input_stream(
    device: &Device,
    config: StreamConfig,
    format: SampleFormat,
    sink: FrameSender,
) -> Result<Stream, String> {
    match format {
        SampleFormat::I16 => build_input_typed::<i16>(device, config, sink),
        SampleFormat::U16 => build_input_typed::<u16>(device, config, sink),
        SampleFormat::F32 => build_input_typed::<f32>(device, config, sink),
        other => Err(format!("Unsupported sample format {:?}", other)),
    }
}

fn build_input_typed<T>(device: &Device, config: StreamConfig, sink: FrameSender) -> Result<Stream, String>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;

    device
        .build_input_stream(
            &config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples = data
                    .iter()
                    .map(|&s| f32_to_pcm16(f32::from_sample_(s)))
                    .collect();
                sink.try_send(AudioFrame {
                    samples,
                    channels,
                    sample_rate,
                });
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())
}

impl AudioTrack for CpalMicrophone {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, sink: FrameSender) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device_info = self.device.clone();
        let stream = StreamThread::spawn("mic-stream", move || {
            let device = find_device(DeviceKind::AudioInput, device_info.as_ref())
                .map_err(|e| e.to_string())?;
            let supported = device
                .default_input_config()
                .map_err(|e| format!("No supported input config: {}", e))?;

            log::info!(
                "Microphone config: {} Hz, {} channels, {:?}",
                supported.sample_rate().0,
                supported.channels(),
                supported.sample_format()
            );

            let format = supported.sample_format();
            build_input_stream(&device, supported.into(), format, sink)
        })
        .map_err(CaptureError::Track)?;

        log::info!("Microphone {} started", self.id);
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            log::info!("Microphone {} stopped", self.id);
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        AudioTrack::stop(self);
    }
}

/// Speaker output pulling from the playback buffer
pub struct CpalSpeaker {
    id: String,
    device: Option<MediaDeviceInfo>,
    stream: Option<StreamThread>,
}

impl CpalSpeaker {
    fn new(id: String, device: Option<MediaDeviceInfo>) -> Self {
        Self {
            id,
            device,
            stream: None,
        }
    }
}

fn build_output_typed<T>(
    device: &Device,
    config: StreamConfig,
    source: PlaybackSource,
) -> Result<Stream, String>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch: Vec<i16> = Vec::new();

    device
        .build_output_stream(
            &config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0);
                source.render(&mut scratch);
                for (frame, &sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    let value = T::from_sample_(sample);
                    frame.fill(value);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())
}

impl AudioOutput for CpalSpeaker {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, source: PlaybackSource) -> Result<(), PlaybackError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device_info = self.device.clone();
        let stream = StreamThread::spawn("speaker-stream", move || {
            let device = find_device(DeviceKind::AudioOutput, device_info.as_ref())
                .map_err(|e| e.to_string())?;
            let supported = device
                .default_output_config()
                .map_err(|e| format!("No supported output config: {}", e))?;

            if supported.sample_rate().0 != source.sample_rate() {
                log::warn!(
                    "Speaker runs at {} Hz but playback audio is {} Hz",
                    supported.sample_rate().0,
                    source.sample_rate()
                );
            }

            let format = supported.sample_format();
            let config: StreamConfig = supported.into();
            match format {
                SampleFormat::I16 => build_output_typed::<i16>(&device, config, source),
                SampleFormat::U16 => build_output_typed::<u16>(&device, config, source),
                SampleFormat::F32 => build_output_typed::<f32>(&device, config, source),
                other => Err(format!("Unsupported sample format {:?}", other)),
            }
        })
        .map_err(PlaybackError::Output)?;

        log::info!("Speaker {} started", self.id);
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            log::info!("Speaker {} stopped", self.id);
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        AudioOutput::stop(self);
    }
}
