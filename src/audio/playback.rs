//! Speech playback buffer with barge-in support
//!
//! Network deltas are appended per utterance; the output stage pulls samples
//! with [`PlaybackSource::render`] at its own pace. Utterances play in the
//! order they were first appended. [`AudioPlayer::interrupt`] drops everything
//! unplayed and reports how far into the current utterance the listener got.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::PlaybackError;

/// Interrupted ids remembered for ignoring trailing deltas
const MAX_INTERRUPTED_IDS: usize = 32;

/// Where output stopped on interrupt
#[derive(Debug, Clone, PartialEq)]
pub struct TrackOffset {
    /// Utterance that was playing, if any
    pub utterance_id: Option<String>,
    /// Samples of that utterance actually rendered
    pub offset: usize,
    /// Output clock in seconds (all samples rendered, silence included)
    pub current_time: f64,
}

#[derive(Debug)]
struct Entry {
    utterance_id: String,
    source_id: Option<String>,
    samples: Vec<i16>,
    cursor: usize,
    /// No more appends will land here
    closed: bool,
}

impl Entry {
    fn remaining(&self) -> usize {
        self.samples.len() - self.cursor
    }
}

/// FIFO of utterances with a single play cursor
#[derive(Debug)]
pub struct PlaybackBuffer {
    entries: VecDeque<Entry>,
    interrupted: VecDeque<String>,
    sample_rate: u32,
    rendered: u64,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            interrupted: VecDeque::new(),
            sample_rate,
            rendered: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append samples to an utterance, creating it if new
    ///
    /// Returns false when the utterance was interrupted and the samples were
    /// ignored.
    pub fn append(&mut self, samples: &[i16], utterance_id: &str) -> bool {
        self.append_from(samples, utterance_id, None)
    }

    /// Append samples tagged with the producing track
    ///
    /// A different `source_id` under the same utterance id means an unrelated
    /// producer replaced the stream: the old entry is closed (it still plays)
    /// and a fresh one is opened.
    pub fn append_from(
        &mut self,
        samples: &[i16],
        utterance_id: &str,
        source_id: Option<&str>,
    ) -> bool {
        if self.interrupted.iter().any(|id| id == utterance_id) {
            log::debug!("Ignoring audio for interrupted utterance {}", utterance_id);
            return false;
        }

        let reuse = match self.entries.back_mut() {
            Some(active) if !active.closed && active.utterance_id == utterance_id => {
                let same_source = match (active.source_id.as_deref(), source_id) {
                    (Some(current), Some(incoming)) => current == incoming,
                    _ => true,
                };
                if same_source {
                    if active.source_id.is_none() {
                        active.source_id = source_id.map(str::to_string);
                    }
                    true
                } else {
                    log::debug!(
                        "Source changed for utterance {}, starting a new entry",
                        utterance_id
                    );
                    active.closed = true;
                    false
                }
            }
            Some(active) => {
                // One active utterance at a time; earlier audio stays queued
                active.closed = true;
                false
            }
            None => false,
        };

        if !reuse {
            self.entries.push_back(Entry {
                utterance_id: utterance_id.to_string(),
                source_id: source_id.map(str::to_string),
                samples: Vec::new(),
                cursor: 0,
                closed: false,
            });
        }

        if let Some(active) = self.entries.back_mut() {
            active.samples.extend_from_slice(samples);
        }
        true
    }

    /// Mark an utterance as complete so the next one can start after it
    pub fn finish(&mut self, utterance_id: &str) {
        for entry in self.entries.iter_mut() {
            if entry.utterance_id == utterance_id {
                entry.closed = true;
            }
        }
    }

    /// Fill `out` from the queue, padding with silence on underrun
    ///
    /// Returns the number of buffered samples written.
    pub fn render(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let Some(front) = self.entries.front_mut() else {
                break;
            };

            let n = front.remaining().min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&front.samples[front.cursor..front.cursor + n]);
            front.cursor += n;
            written += n;

            if front.remaining() == 0 {
                if front.closed {
                    let done = self.entries.pop_front();
                    if let Some(done) = done {
                        log::debug!(
                            "Utterance {} played ({} samples)",
                            done.utterance_id,
                            done.samples.len()
                        );
                    }
                } else {
                    // Still streaming; wait for more data
                    break;
                }
            }
        }

        out[written..].fill(0);
        self.rendered += out.len() as u64;
        written
    }

    /// Drop all unplayed audio and report the stop position
    pub fn interrupt(&mut self) -> TrackOffset {
        let current_time = self.current_time();

        let Some(playing) = self.entries.front() else {
            return TrackOffset {
                utterance_id: None,
                offset: 0,
                current_time,
            };
        };

        let offset = TrackOffset {
            utterance_id: Some(playing.utterance_id.clone()),
            offset: playing.cursor,
            current_time,
        };

        for entry in self.entries.drain(..) {
            if !self.interrupted.contains(&entry.utterance_id) {
                self.interrupted.push_back(entry.utterance_id);
            }
        }
        while self.interrupted.len() > MAX_INTERRUPTED_IDS {
            self.interrupted.pop_front();
        }

        log::info!(
            "Playback interrupted at sample {} of {:?}",
            offset.offset,
            offset.utterance_id
        );
        offset
    }

    pub fn is_playing(&self) -> bool {
        self.entries.iter().any(|e| e.remaining() > 0)
    }

    pub fn queued_samples(&self) -> usize {
        self.entries.iter().map(Entry::remaining).sum()
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.rendered as f64 / self.sample_rate as f64
    }

    pub fn was_interrupted(&self, utterance_id: &str) -> bool {
        self.interrupted.iter().any(|id| id == utterance_id)
    }
}

/// Clonable pull handle given to an output stage
#[derive(Clone)]
pub struct PlaybackSource {
    buffer: Arc<Mutex<PlaybackBuffer>>,
}

impl PlaybackSource {
    pub fn render(&self, out: &mut [i16]) -> usize {
        lock(&self.buffer).render(out)
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.buffer).sample_rate()
    }
}

fn lock(buffer: &Mutex<PlaybackBuffer>) -> MutexGuard<'_, PlaybackBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Speaker (or anything else) that pulls from a [`PlaybackSource`]
pub trait AudioOutput: Send {
    fn id(&self) -> &str;

    fn start(&mut self, source: PlaybackSource) -> Result<(), PlaybackError>;

    /// Stop pulling; idempotent
    fn stop(&mut self);
}

/// Output pulled by hand through an [`OutputTap`]
pub struct ManualOutput {
    id: String,
    source: Arc<Mutex<Option<PlaybackSource>>>,
}

#[derive(Clone)]
pub struct OutputTap {
    source: Arc<Mutex<Option<PlaybackSource>>>,
}

impl ManualOutput {
    pub fn new(id: impl Into<String>) -> (Self, OutputTap) {
        let source = Arc::new(Mutex::new(None));
        (
            Self {
                id: id.into(),
                source: source.clone(),
            },
            OutputTap { source },
        )
    }
}

impl AudioOutput for ManualOutput {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, source: PlaybackSource) -> Result<(), PlaybackError> {
        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
        Ok(())
    }

    fn stop(&mut self) {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl OutputTap {
    /// Render `len` samples; `None` when the output is detached
    pub fn pull(&self, len: usize) -> Option<Vec<i16>> {
        let guard = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        let source = guard.as_ref()?;
        let mut out = vec![0i16; len];
        source.render(&mut out);
        Some(out)
    }

    pub fn is_attached(&self) -> bool {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Owns the playback buffer and the current output stage
pub struct AudioPlayer {
    buffer: Arc<Mutex<PlaybackBuffer>>,
    output: Option<Box<dyn AudioOutput>>,
}

impl AudioPlayer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(PlaybackBuffer::new(sample_rate))),
            output: None,
        }
    }

    pub fn source(&self) -> PlaybackSource {
        PlaybackSource {
            buffer: self.buffer.clone(),
        }
    }

    /// Swap the output stage; queued audio is kept
    pub fn set_output(&mut self, mut output: Box<dyn AudioOutput>) -> Result<(), PlaybackError> {
        if let Some(mut old) = self.output.take() {
            old.stop();
            log::info!("Switching audio output {} -> {}", old.id(), output.id());
        }
        output.start(self.source())?;
        self.output = Some(output);
        Ok(())
    }

    pub fn output_id(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.id())
    }

    pub fn append(&self, samples: &[i16], utterance_id: &str) -> bool {
        lock(&self.buffer).append(samples, utterance_id)
    }

    pub fn append_from(&self, samples: &[i16], utterance_id: &str, source_id: Option<&str>) -> bool {
        lock(&self.buffer).append_from(samples, utterance_id, source_id)
    }

    pub fn finish(&self, utterance_id: &str) {
        lock(&self.buffer).finish(utterance_id)
    }

    /// Halt output now; safe with nothing playing
    pub fn interrupt(&self) -> TrackOffset {
        lock(&self.buffer).interrupt()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.buffer).is_playing()
    }

    pub fn queued_samples(&self) -> usize {
        lock(&self.buffer).queued_samples()
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.buffer).sample_rate()
    }

    /// Detach the output stage
    pub fn stop(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
