//! Audio capture and playback
//!
//! Capture turns a live track into fixed-size network chunks; playback buffers
//! streamed speech and supports barge-in. System devices live behind the
//! `host-audio` feature.

pub mod capture;
#[cfg(feature = "host-audio")]
pub mod host;
pub mod levels;
pub mod playback;

pub use capture::{
    AudioCapture, AudioChunk, AudioFrame, AudioTrack, CaptureState, ChunkReceiver, Chunker,
    FrameSender, ManualTrack, TrackFeed,
};
pub use levels::{LevelMeter, Levels};
pub use playback::{
    AudioOutput, AudioPlayer, ManualOutput, OutputTap, PlaybackBuffer, PlaybackSource, TrackOffset,
};
