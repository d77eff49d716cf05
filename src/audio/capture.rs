//! Microphone capture chunker
//!
//! Capture runs on a dedicated processing thread. The host's audio callback
//! pushes [`AudioFrame`]s into a bounded, ordered queue (never blocking); the
//! same queue carries control commands, so a `pause()` issued after a frame is
//! always applied after that frame. The thread accumulates samples and emits
//! [`AudioChunk`]s on a second bounded queue once the accumulated mono data
//! reaches the configured size.
//!
//! ```text
//! ended --begin--> paused --record--> recording --pause--> paused --end--> ended
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use super::levels::{LevelMeter, Levels};
use crate::config::AudioConfig;
use crate::error::CaptureError;

/// Queue depth between the audio callback and the processing thread
const INPUT_QUEUE_DEPTH: usize = 256;

/// Queue depth for emitted chunks
const CHUNK_QUEUE_DEPTH: usize = 64;

/// Log a summary every N chunks
const LOG_INTERVAL_CHUNKS: u64 = 50;

/// One buffer of interleaved PCM16 from a track
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: 1,
            sample_rate,
        }
    }
}

/// Framed audio ready for the network
///
/// `mono` is at the wire rate; `raw` is the untouched interleaved input.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub mono: Vec<i16>,
    pub raw: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    pub fn mono_bytes(&self) -> usize {
        self.mono.len() * std::mem::size_of::<i16>()
    }

    /// Duration of the mono data in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.mono.len() as u64 * 1000) / self.sample_rate as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Ended,
    Paused,
    Recording,
}

/// Convert a float sample to PCM16, clamping out-of-range input
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_finite() {
        sample.clamp(-1.0, 1.0)
    } else {
        0.0
    };
    (clamped * i16::MAX as f32) as i16
}

/// Convert an unsigned 16-bit sample (midpoint 32768) to PCM16
pub fn u16_to_pcm16(sample: u16) -> i16 {
    (sample as i32 - 32_768) as i16
}

/// Average interleaved channels down to mono
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Re-interleave samples for another channel count via their mono mix
pub fn relayout(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    if from == to {
        return samples.to_vec();
    }
    let width = to.max(1) as usize;
    downmix(samples, from)
        .into_iter()
        .flat_map(|s| std::iter::repeat(s).take(width))
        .collect()
}

/// Downsample by averaging groups of samples
///
/// Only integer ratios are supported (48kHz -> 16kHz, 48kHz -> 24kHz, ...);
/// other ratios return the input unchanged with a warning.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || source_rate < target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;
    samples
        .chunks(ratio)
        .map(|group| {
            let sum: i64 = group.iter().map(|&s| s as i64).sum();
            (sum / group.len() as i64) as i16
        })
        .collect()
}

/// The pure accumulation state machine run by the processing thread
#[derive(Debug)]
pub struct Chunker {
    state: CaptureState,
    chunk_size_bytes: usize,
    target_rate: u32,
    mono: Vec<i16>,
    raw: Vec<i16>,
    channels: u16,
    meter: LevelMeter,
    emitted_chunks: u64,
    emitted_bytes: u64,
}

impl Chunker {
    pub fn new(chunk_size_bytes: usize, target_rate: u32) -> Self {
        Self {
            state: CaptureState::Ended,
            chunk_size_bytes: chunk_size_bytes.max(2),
            target_rate,
            mono: Vec::new(),
            raw: Vec::new(),
            channels: 1,
            meter: LevelMeter::new(target_rate),
            emitted_chunks: 0,
            emitted_bytes: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn begin(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Ended {
            return Err(CaptureError::AlreadyBegun);
        }
        self.state = CaptureState::Paused;
        self.meter.reset();
        Ok(())
    }

    pub fn record(&mut self) -> Result<(), CaptureError> {
        match self.state {
            CaptureState::Paused => {
                self.state = CaptureState::Recording;
                Ok(())
            }
            CaptureState::Recording => Err(CaptureError::AlreadyRecording),
            CaptureState::Ended => Err(CaptureError::NotBegun),
        }
    }

    /// Stop chunking; returns the partial chunk accumulated so far
    pub fn pause(&mut self) -> Result<Option<AudioChunk>, CaptureError> {
        match self.state {
            CaptureState::Recording => {
                self.state = CaptureState::Paused;
                Ok(self.flush())
            }
            CaptureState::Paused => Err(CaptureError::NotRecording),
            CaptureState::Ended => Err(CaptureError::NotBegun),
        }
    }

    /// Finish the session from either paused or recording
    pub fn end(&mut self) -> Result<Option<AudioChunk>, CaptureError> {
        if self.state == CaptureState::Ended {
            return Err(CaptureError::NotBegun);
        }
        self.state = CaptureState::Ended;
        let last = self.flush();
        self.meter.reset();
        log::debug!(
            "Capture session ended: {} chunks, {} bytes",
            self.emitted_chunks,
            self.emitted_bytes
        );
        Ok(last)
    }

    /// Feed one frame; returns a chunk once enough audio has accumulated
    pub fn push_frame(&mut self, frame: &AudioFrame) -> Option<AudioChunk> {
        if self.state == CaptureState::Ended || frame.samples.is_empty() {
            return None;
        }

        let mono = downsample(
            &downmix(&frame.samples, frame.channels),
            frame.sample_rate,
            self.target_rate,
        );
        self.meter.push_samples(&mono);

        if self.state != CaptureState::Recording {
            return None;
        }

        if self.channels != frame.channels && !self.raw.is_empty() {
            // Device switch mid-chunk: the pending raw audio follows the new layout
            log::debug!(
                "Channel layout changed from {} to {} mid-chunk",
                self.channels,
                frame.channels
            );
            self.raw = relayout(&self.raw, self.channels, frame.channels);
        }
        self.channels = frame.channels;

        self.mono.extend_from_slice(&mono);
        self.raw.extend_from_slice(&frame.samples);

        if self.mono.len() * std::mem::size_of::<i16>() >= self.chunk_size_bytes {
            self.flush()
        } else {
            None
        }
    }

    pub fn levels(&self) -> Levels {
        self.meter.levels()
    }

    fn flush(&mut self) -> Option<AudioChunk> {
        if self.mono.is_empty() {
            return None;
        }

        let chunk = AudioChunk {
            mono: std::mem::take(&mut self.mono),
            raw: std::mem::take(&mut self.raw),
            sample_rate: self.target_rate,
            channels: self.channels,
        };

        self.emitted_chunks += 1;
        self.emitted_bytes += chunk.mono_bytes() as u64;
        if self.emitted_chunks % LOG_INTERVAL_CHUNKS == 0 {
            log::debug!(
                "Captured {} chunks ({} bytes)",
                self.emitted_chunks,
                self.emitted_bytes
            );
        }
        Some(chunk)
    }
}

enum Command {
    Begin(oneshot::Sender<Result<(), CaptureError>>),
    Record(oneshot::Sender<Result<(), CaptureError>>),
    Pause(oneshot::Sender<Result<(), CaptureError>>),
    End(oneshot::Sender<Result<(), CaptureError>>),
    Levels(oneshot::Sender<Levels>),
    State(oneshot::Sender<CaptureState>),
}

enum Input {
    Frame(AudioFrame),
    Control(Command),
}

/// Handle given to a track for delivering frames
///
/// `try_send` never blocks, so it is safe from a real-time audio callback;
/// frames that do not fit in the queue are dropped and counted.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Input>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    pub fn try_send(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(Input::Frame(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % LOG_INTERVAL_CHUNKS == 1 {
                    log::warn!("Capture queue full, {} frames dropped so far", dropped);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A live audio source supplied by the host (microphone, file, test feed)
///
/// `Sync` so a capture handle can be shared by async tasks.
pub trait AudioTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Start delivering frames to `sink`
    fn start(&mut self, sink: FrameSender) -> Result<(), CaptureError>;

    /// Stop delivering frames; idempotent
    fn stop(&mut self);
}

/// Track fed by hand through a [`TrackFeed`]
pub struct ManualTrack {
    id: String,
    sink: Arc<Mutex<Option<FrameSender>>>,
}

/// Producer side of a [`ManualTrack`]
#[derive(Clone)]
pub struct TrackFeed {
    sink: Arc<Mutex<Option<FrameSender>>>,
}

impl ManualTrack {
    pub fn new(id: impl Into<String>) -> (Self, TrackFeed) {
        let sink = Arc::new(Mutex::new(None));
        (
            Self {
                id: id.into(),
                sink: sink.clone(),
            },
            TrackFeed { sink },
        )
    }
}

impl AudioTrack for ManualTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, sink: FrameSender) -> Result<(), CaptureError> {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl TrackFeed {
    /// Deliver a frame; false when the track is stopped or the queue is full
    pub fn push(&self, frame: AudioFrame) -> bool {
        let guard = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sink) => sink.try_send(frame),
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Receiver of emitted chunks
pub type ChunkReceiver = mpsc::Receiver<AudioChunk>;

/// Control handle for the capture thread
pub struct AudioCapture {
    input: mpsc::Sender<Input>,
    frames: FrameSender,
    track: Option<Box<dyn AudioTrack>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Spawn the processing thread
    pub fn spawn(config: &AudioConfig) -> Result<(Self, ChunkReceiver), CaptureError> {
        let (input, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let chunker = Chunker::new(config.chunk_size_bytes, config.wire_sample_rate);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_processor(chunker, input_rx, chunk_tx))
            .map_err(|e| CaptureError::Track(format!("failed to spawn capture thread: {}", e)))?;

        let frames = FrameSender {
            tx: input.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        Ok((
            Self {
                input,
                frames,
                track: None,
                thread: Some(thread),
            },
            chunk_rx,
        ))
    }

    async fn control<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CaptureError> {
        let (tx, rx) = oneshot::channel();
        self.input
            .send(Input::Control(make(tx)))
            .await
            .map_err(|_| CaptureError::ProcessorGone)?;
        rx.await.map_err(|_| CaptureError::ProcessorGone)
    }

    /// Attach a track and enter `paused`
    pub async fn begin(&mut self, mut track: Box<dyn AudioTrack>) -> Result<(), CaptureError> {
        self.control(Command::Begin).await??;

        if let Err(e) = track.start(self.frames.clone()) {
            log::error!("Failed to start track {}: {}", track.id(), e);
            let _ = self.control(Command::End).await;
            return Err(e);
        }

        log::info!("Capture begun on track {}", track.id());
        self.track = Some(track);
        Ok(())
    }

    pub async fn record(&self) -> Result<(), CaptureError> {
        self.control(Command::Record).await??;
        log::debug!("Capture recording");
        Ok(())
    }

    /// Stop chunking; the partial chunk is flushed first
    pub async fn pause(&self) -> Result<(), CaptureError> {
        self.control(Command::Pause).await??;
        log::debug!("Capture paused");
        Ok(())
    }

    /// Detach the track and finish the session
    pub async fn end(&mut self) -> Result<(), CaptureError> {
        if let Some(mut track) = self.track.take() {
            track.stop();
        }
        self.control(Command::End).await??;
        log::info!("Capture ended");
        Ok(())
    }

    /// Replace the source track without changing the capture state
    pub fn set_track(&mut self, mut track: Box<dyn AudioTrack>) -> Result<(), CaptureError> {
        if let Some(mut old) = self.track.take() {
            old.stop();
            log::info!("Switching capture track {} -> {}", old.id(), track.id());
        }
        track.start(self.frames.clone())?;
        self.track = Some(track);
        Ok(())
    }

    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.id())
    }

    pub async fn levels(&self) -> Result<Levels, CaptureError> {
        self.control(Command::Levels).await
    }

    pub async fn state(&self) -> Result<CaptureState, CaptureError> {
        self.control(Command::State).await
    }

    pub fn dropped_frames(&self) -> u64 {
        self.frames.dropped_frames()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(mut track) = self.track.take() {
            track.stop();
        }
        // The thread exits once every input sender is gone; tracks may still
        // hold clones, so it is detached rather than joined.
        drop(self.thread.take());
    }
}

fn run_processor(
    mut chunker: Chunker,
    mut input: mpsc::Receiver<Input>,
    chunks: mpsc::Sender<AudioChunk>,
) {
    log::debug!("Capture thread started");

    let emit = |chunk: Option<AudioChunk>| {
        if let Some(chunk) = chunk {
            if chunks.blocking_send(chunk).is_err() {
                log::debug!("Chunk receiver dropped");
            }
        }
    };

    while let Some(message) = input.blocking_recv() {
        match message {
            Input::Frame(frame) => emit(chunker.push_frame(&frame)),
            Input::Control(Command::Begin(reply)) => {
                let _ = reply.send(chunker.begin());
            }
            Input::Control(Command::Record(reply)) => {
                let _ = reply.send(chunker.record());
            }
            Input::Control(Command::Pause(reply)) => {
                let result = chunker.pause().map(|chunk| emit(chunk));
                let _ = reply.send(result);
            }
            Input::Control(Command::End(reply)) => {
                let result = chunker.end().map(|chunk| emit(chunk));
                let _ = reply.send(result);
            }
            Input::Control(Command::Levels(reply)) => {
                let _ = reply.send(chunker.levels());
            }
            Input::Control(Command::State(reply)) => {
                let _ = reply.send(chunker.state());
            }
        }
    }

    log::debug!("Capture thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size_bytes: usize, wire_sample_rate: u32) -> AudioConfig {
        AudioConfig {
            chunk_size_bytes,
            wire_sample_rate,
            ..AudioConfig::default()
        }
    }

    #[test]
    fn test_sample_conversion() {
        assert_eq!(f32_to_pcm16(0.0), 0);
        assert_eq!(f32_to_pcm16(1.0), i16::MAX);
        assert_eq!(f32_to_pcm16(-1.0), -i16::MAX);
        assert_eq!(f32_to_pcm16(2.0), i16::MAX);
        assert_eq!(f32_to_pcm16(-2.0), -i16::MAX);
        assert_eq!(f32_to_pcm16(f32::NAN), 0);

        assert_eq!(u16_to_pcm16(32_768), 0);
        assert_eq!(u16_to_pcm16(0), i16::MIN);
        assert_eq!(u16_to_pcm16(u16::MAX), i16::MAX);
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_downsample_integer_ratio() {
        let input: Vec<i16> = vec![100, 200, 300, 400, 500, 600];
        assert_eq!(downsample(&input, 48_000, 16_000), vec![200, 500]);
        assert_eq!(downsample(&input, 16_000, 16_000), input);
        // Non-integer ratio and upsampling pass through
        assert_eq!(downsample(&input, 44_100, 16_000), input);
        assert_eq!(downsample(&input, 8_000, 16_000), input);
        assert_eq!(downsample(&input, 0, 16_000), input);
    }

    #[test]
    fn test_state_transitions_reported() {
        let mut chunker = Chunker::new(3200, 16_000);

        assert_eq!(chunker.record(), Err(CaptureError::NotBegun));
        assert_eq!(chunker.pause(), Err(CaptureError::NotBegun));
        assert_eq!(chunker.end(), Err(CaptureError::NotBegun));

        chunker.begin().unwrap();
        assert_eq!(chunker.begin(), Err(CaptureError::AlreadyBegun));
        assert_eq!(chunker.pause(), Err(CaptureError::NotRecording));

        chunker.record().unwrap();
        assert_eq!(chunker.record(), Err(CaptureError::AlreadyRecording));
        assert_eq!(chunker.state(), CaptureState::Recording);

        chunker.pause().unwrap();
        chunker.end().unwrap();
        assert_eq!(chunker.state(), CaptureState::Ended);
    }

    #[test]
    fn test_chunks_at_least_configured_size_and_nothing_lost() {
        let chunk_size = 3200;
        let mut chunker = Chunker::new(chunk_size, 16_000);
        chunker.begin().unwrap();
        chunker.record().unwrap();

        let mut emitted = Vec::new();
        let mut captured_bytes = 0usize;
        // Irregular frame sizes, like a real callback
        for i in 0..40 {
            let len = 300 + (i * 37) % 500;
            captured_bytes += len * 2;
            let frame = AudioFrame::mono(vec![i as i16; len], 16_000);
            if let Some(chunk) = chunker.push_frame(&frame) {
                emitted.push(chunk);
            }
        }
        if let Some(last) = chunker.end().unwrap() {
            assert!(last.mono_bytes() < chunk_size);
            emitted.push(last);
        }

        let (last, full) = emitted.split_last().unwrap();
        for chunk in full {
            assert!(chunk.mono_bytes() >= chunk_size);
        }
        assert!(!last.mono.is_empty());

        let total: usize = emitted.iter().map(|c| c.mono_bytes()).sum();
        assert_eq!(total, captured_bytes);
    }

    #[test]
    fn test_paused_frames_feed_levels_only() {
        let mut chunker = Chunker::new(64, 16_000);
        chunker.begin().unwrap();

        let loud: Vec<i16> = (0..512)
            .map(|i| ((i as f32 * 2.0 * std::f32::consts::PI / 16.0).sin() * 20_000.0) as i16)
            .collect();
        assert_eq!(chunker.push_frame(&AudioFrame::mono(loud, 16_000)), None);
        assert!(chunker.levels().peak() > 0.0);

        chunker.record().unwrap();
        assert_eq!(chunker.pause().unwrap(), None);
    }

    #[test]
    fn test_stereo_48k_is_framed_at_wire_rate() {
        let mut chunker = Chunker::new(320, 16_000);
        chunker.begin().unwrap();
        chunker.record().unwrap();

        // 480 stereo samples at 48kHz -> 240 mono -> 80 at 16kHz
        let frame = AudioFrame {
            samples: vec![600; 480],
            channels: 2,
            sample_rate: 48_000,
        };
        assert_eq!(chunker.push_frame(&frame), None);
        let chunk = chunker.push_frame(&frame).unwrap();

        assert_eq!(chunk.mono.len(), 160);
        assert_eq!(chunk.raw.len(), 960);
        assert_eq!(chunk.channels, 2);
        assert_eq!(chunk.sample_rate, 16_000);
        assert_eq!(chunk.duration_ms(), 10);
        assert!(chunk.mono.iter().all(|&s| s == 600));
    }

    #[test]
    fn test_layout_change_keeps_accumulating() {
        let mut chunker = Chunker::new(320, 16_000);
        chunker.begin().unwrap();
        chunker.record().unwrap();

        assert_eq!(chunker.push_frame(&AudioFrame::mono(vec![100; 50], 16_000)), None);
        // 120 stereo samples -> 60 mono, 110 in total is still short of 160
        let stereo = AudioFrame {
            samples: vec![300; 120],
            channels: 2,
            sample_rate: 16_000,
        };
        assert_eq!(chunker.push_frame(&stereo), None);
        assert_eq!(chunker.state(), CaptureState::Recording);

        let chunk = chunker.push_frame(&stereo).unwrap();
        assert_eq!(chunk.mono_bytes(), 340);
        assert_eq!(chunk.channels, 2);
        assert_eq!(chunk.raw.len(), chunk.mono.len() * 2);
        assert_eq!(&chunk.raw[..4], &[100, 100, 100, 100]);
        assert!(chunk.mono[50..].iter().all(|&s| s == 300));
    }

    #[test]
    fn test_relayout() {
        assert_eq!(relayout(&[1, 3, 5, 7], 2, 1), vec![2, 6]);
        assert_eq!(relayout(&[4, 8], 1, 2), vec![4, 4, 8, 8]);
        assert_eq!(relayout(&[1, 2], 1, 1), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_capture_thread_orders_frames_and_controls() {
        let (mut capture, mut chunks) = AudioCapture::spawn(&config(400, 16_000)).unwrap();
        let (track, feed) = ManualTrack::new("mic-1");

        assert_eq!(capture.record().await, Err(CaptureError::NotBegun));
        capture.begin(Box::new(track)).await.unwrap();
        assert_eq!(capture.track_id(), Some("mic-1"));
        assert!(feed.is_live());

        let (other, _) = ManualTrack::new("mic-2");
        assert_eq!(capture.begin(Box::new(other)).await, Err(CaptureError::AlreadyBegun));

        capture.record().await.unwrap();
        assert!(feed.push(AudioFrame::mono(vec![1; 250], 16_000)));
        assert!(feed.push(AudioFrame::mono(vec![2; 50], 16_000)));

        let first = chunks.recv().await.unwrap();
        assert_eq!(first.mono.len(), 250);

        // The partial chunk is flushed before pause replies
        capture.pause().await.unwrap();
        let partial = chunks.recv().await.unwrap();
        assert_eq!(partial.mono, vec![2; 50]);

        assert_eq!(capture.state().await, Ok(CaptureState::Paused));
        capture.end().await.unwrap();
        assert!(!feed.is_live());
        assert_eq!(capture.state().await, Ok(CaptureState::Ended));
    }

    #[tokio::test]
    async fn test_set_track_keeps_state() {
        let (mut capture, mut chunks) = AudioCapture::spawn(&config(100, 16_000)).unwrap();
        let (first, first_feed) = ManualTrack::new("first");
        capture.begin(Box::new(first)).await.unwrap();
        capture.record().await.unwrap();

        let (second, second_feed) = ManualTrack::new("second");
        capture.set_track(Box::new(second)).unwrap();

        assert!(!first_feed.is_live());
        assert!(!first_feed.push(AudioFrame::mono(vec![1; 60], 16_000)));
        assert!(second_feed.push(AudioFrame::mono(vec![3; 60], 16_000)));

        let chunk = chunks.recv().await.unwrap();
        assert_eq!(chunk.mono, vec![3; 60]);
        assert_eq!(capture.state().await, Ok(CaptureState::Recording));
    }
}
