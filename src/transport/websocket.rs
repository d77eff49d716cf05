//! Duplex-socket backend
//!
//! One [`ReconnectingChannel`] carries everything: control envelopes as text
//! frames, microphone audio as `raw-audio-batch` messages and bot speech as
//! binary PCM16 frames or `bot-tts-audio` envelopes. Speech is played through
//! the local [`AudioPlayer`], which also handles barge-in.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use super::{BackendEvent, BackendSink, Transport, TransportBackend};
use crate::audio::{AudioCapture, AudioChunk, AudioPlayer, ChunkReceiver, TrackOffset};
use crate::channel::{
    ChannelEvent, ChannelEvents, ChannelOptions, DropReason, Frame, ReconnectingChannel,
    SocketConnector, WsConnector,
};
use crate::config::TransportConfig;
use crate::devices::{DeviceKind, DeviceManager, MediaDevices};
use crate::diagnostics::DiagnosticHook;
use crate::error::TransportError;
use crate::media::{MediaKind, Participant, TrackInfo};
use crate::protocol::{
    classify, decode_pcm16, message_types, pcm16_from_le_bytes, BotAudio, ControlMessage, Inbound,
    RawAudioBatch,
};

/// Track id under which inbound bot speech is reported
const BOT_AUDIO_TRACK: &str = "bot-audio";

/// Log a summary every N audio batches
const LOG_INTERVAL_BATCHES: u64 = 50;

pub struct WebSocketBackend {
    inner: Arc<WsInner>,
}

struct WsInner {
    config: TransportConfig,
    connector: Arc<dyn SocketConnector>,
    events: Mutex<Option<BackendSink>>,
    channel: Mutex<Option<ReconnectingChannel>>,
    channel_task: Mutex<Option<JoinHandle<()>>>,
    capture: tokio::sync::Mutex<Option<AudioCapture>>,
    chunk_task: Mutex<Option<JoinHandle<()>>>,
    player: Mutex<AudioPlayer>,
    /// Utterance that untagged binary speech is appended to
    utterance: Mutex<String>,
    local_track: Mutex<Option<TrackInfo>>,
    bot_track_live: Mutex<bool>,
}

impl WebSocketBackend {
    pub fn new(config: &TransportConfig, connector: Arc<dyn SocketConnector>) -> Self {
        let inner = WsInner {
            config: config.clone(),
            connector,
            events: Mutex::new(None),
            channel: Mutex::new(None),
            channel_task: Mutex::new(None),
            capture: tokio::sync::Mutex::new(None),
            chunk_task: Mutex::new(None),
            player: Mutex::new(AudioPlayer::new(config.audio.output_sample_rate)),
            utterance: Mutex::new(new_utterance_id()),
            local_track: Mutex::new(None),
            bot_track_live: Mutex::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl Transport {
    /// Transport over a reconnecting duplex socket
    pub fn websocket(
        config: &TransportConfig,
        connector: Arc<dyn SocketConnector>,
        devices: Arc<dyn MediaDevices>,
        diagnostics: Option<Arc<dyn DiagnosticHook>>,
    ) -> Self {
        let backend = WebSocketBackend::new(config, connector);
        Transport::new(Arc::new(backend), devices, diagnostics)
    }

    /// Duplex-socket transport dialing `config.websocket.url` over tungstenite
    pub fn websocket_from_config(
        config: &TransportConfig,
        devices: Arc<dyn MediaDevices>,
        diagnostics: Option<Arc<dyn DiagnosticHook>>,
    ) -> Self {
        Self::websocket(config, Arc::new(WsConnector::new()), devices, diagnostics)
    }
}

impl TransportBackend for WebSocketBackend {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn initialize_backend(&self, events: BackendSink) {
        *lock(&self.inner.events) = Some(events);
    }

    fn init_media(&self, devices: DeviceManager) -> BoxFuture<'static, Result<(), TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mic = inner.start_microphone(&devices).await;
            let speaker = inner.start_speaker(&devices);
            mic.and(speaker)
        })
    }

    fn connect_backend(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let channel = inner.open_channel();
            channel.connect().await?;

            if let Some(capture) = inner.capture.lock().await.as_ref() {
                if let Err(e) = capture.record().await {
                    log::warn!("Failed to start microphone streaming: {}", e);
                }
            }
            Ok(())
        })
    }

    fn send_backend(&self, message: &ControlMessage) -> Result<(), TransportError> {
        self.inner.send_json(message)
    }

    fn teardown_backend(&self) -> BoxFuture<'static, ()> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.teardown().await })
    }

    fn switch_device(
        &self,
        kind: DeviceKind,
        devices: DeviceManager,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            match kind {
                DeviceKind::AudioInput => inner.switch_microphone(&devices).await,
                DeviceKind::AudioOutput => inner.start_speaker(&devices),
                DeviceKind::VideoInput => {
                    log::debug!("Duplex transport carries no video, camera switch ignored");
                    Ok(())
                }
            }
        })
    }

    fn interrupt_playback(&self) -> Option<TrackOffset> {
        Some(self.inner.barge_in())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_utterance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl WsInner {
    fn emit(&self, event: BackendEvent) {
        if let Some(sink) = lock(&self.events).as_ref() {
            if sink.send(event).is_err() {
                log::debug!("Transport engine gone, dropping backend event");
            }
        }
    }

    fn current_channel(&self) -> Option<ReconnectingChannel> {
        lock(&self.channel).clone()
    }

    fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(value).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let channel = self.current_channel().ok_or(TransportError::NotReady)?;
        channel.send_text(text)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    async fn start_microphone(self: &Arc<Self>, devices: &DeviceManager) -> Result<(), TransportError> {
        if !self.config.media.enable_mic {
            log::info!("Microphone disabled by config");
            return Ok(());
        }

        let track = devices.open_microphone()?;
        let (mut capture, chunks) = AudioCapture::spawn(&self.config.audio)?;
        capture.begin(track).await?;

        let local = capture
            .track_id()
            .map(|id| TrackInfo::new(id, MediaKind::Audio, Participant::Local));
        *self.capture.lock().await = Some(capture);

        let batch_size = self.config.audio.batch_size.max(1);
        let task = tokio::spawn(forward_chunks(Arc::downgrade(self), chunks, batch_size));
        if let Some(old) = lock(&self.chunk_task).replace(task) {
            old.abort();
        }

        if let Some(track) = local {
            *lock(&self.local_track) = Some(track.clone());
            self.emit(BackendEvent::TrackStarted(track));
        }
        Ok(())
    }

    fn start_speaker(&self, devices: &DeviceManager) -> Result<(), TransportError> {
        if !self.config.media.enable_speaker {
            log::info!("Speaker disabled by config");
            return Ok(());
        }
        let output = devices.open_speaker()?;
        lock(&self.player).set_output(output)?;
        Ok(())
    }

    /// Rebuild the capture stage on the newly selected microphone
    async fn switch_microphone(self: &Arc<Self>, devices: &DeviceManager) -> Result<(), TransportError> {
        let mut guard = self.capture.lock().await;
        if guard.is_none() {
            drop(guard);
            return self.start_microphone(devices).await;
        }

        let track = devices.open_microphone()?;
        let Some(capture) = guard.as_mut() else {
            return Ok(());
        };
        capture.set_track(track)?;

        let started = capture
            .track_id()
            .map(|id| TrackInfo::new(id, MediaKind::Audio, Participant::Local));
        let stopped = std::mem::replace(&mut *lock(&self.local_track), started.clone());
        if let Some(track) = stopped {
            self.emit(BackendEvent::TrackStopped(track));
        }
        if let Some(track) = started {
            self.emit(BackendEvent::TrackStarted(track));
        }
        Ok(())
    }

    /// Stop playback and tell the remote how much of the utterance was heard
    fn barge_in(&self) -> TrackOffset {
        let offset = lock(&self.player).interrupt();
        *lock(&self.utterance) = new_utterance_id();

        if let Some(id) = offset.utterance_id.as_deref() {
            log::info!("Barge-in: {} interrupted at sample {}", id, offset.offset);
            let truncated = ControlMessage::audio_truncated(id, offset.offset as u64);
            if let Err(e) = self.send_json(&truncated) {
                log::warn!("Failed to report truncated audio: {}", e);
            }
        }
        offset
    }

    fn play(&self, samples: &[i16], utterance_id: &str) {
        if samples.is_empty() {
            return;
        }
        if !lock(&self.player).append(samples, utterance_id) {
            log::debug!("Ignoring audio for interrupted utterance {}", utterance_id);
            return;
        }

        let first = !std::mem::replace(&mut *lock(&self.bot_track_live), true);
        if first {
            self.emit(BackendEvent::TrackStarted(TrackInfo::new(
                BOT_AUDIO_TRACK,
                MediaKind::Audio,
                Participant::Bot,
            )));
        }
    }

    fn play_tts(&self, message: &ControlMessage) {
        let audio: BotAudio = match serde_json::from_value(message.data.clone()) {
            Ok(audio) => audio,
            Err(e) => {
                self.emit(BackendEvent::Error(TransportError::Protocol(format!(
                    "malformed bot-tts-audio: {}",
                    e
                ))));
                return;
            }
        };

        let rate = lock(&self.player).sample_rate();
        if let Some(incoming) = audio.sample_rate.filter(|r| *r != rate) {
            log::warn!(
                "Bot audio at {} Hz played at {} Hz (utterance {})",
                incoming,
                rate,
                audio.id
            );
        }

        match decode_pcm16(&audio.audio) {
            Ok(samples) => self.play(&samples, &audio.id),
            Err(e) => self.emit(BackendEvent::Error(TransportError::Protocol(format!(
                "bad audio payload: {}",
                e
            )))),
        }
    }

    // ------------------------------------------------------------------
    // Channel
    // ------------------------------------------------------------------

    /// Replace any previous channel with a fresh one and start its pump
    fn open_channel(self: &Arc<Self>) -> ReconnectingChannel {
        let options = ChannelOptions::from(&self.config.websocket);
        let (channel, events) = ReconnectingChannel::new(options, self.connector.clone());

        if let Some(old) = lock(&self.channel).replace(channel.clone()) {
            old.close();
        }
        let task = tokio::spawn(channel_pump(Arc::downgrade(self), events));
        if let Some(old) = lock(&self.channel_task).replace(task) {
            old.abort();
        }
        channel
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open { reconnected } => {
                self.emit(BackendEvent::Connected { reconnected })
            }
            ChannelEvent::Message(Frame::Text(text)) => self.on_text(&text),
            ChannelEvent::Message(Frame::Binary(bytes)) => {
                let utterance = lock(&self.utterance).clone();
                self.play(&pcm16_from_le_bytes(&bytes), &utterance);
            }
            ChannelEvent::Dropped(DropReason::Stale) => {
                log::warn!("{}", TransportError::StaleConnection)
            }
            ChannelEvent::Dropped(reason) => log::warn!("Connection dropped: {:?}", reason),
            ChannelEvent::Reconnecting { attempt, delay } => {
                self.emit(BackendEvent::Reconnecting { attempt, delay })
            }
            ChannelEvent::Retrying { attempt } => self.emit(BackendEvent::Retrying { attempt }),
            ChannelEvent::ReconnectFailed { attempts } => {
                self.emit(BackendEvent::Failed(TransportError::ExhaustedRetries { attempts }))
            }
            ChannelEvent::KeepAlive => {
                if let Err(e) = self.send_json(&ControlMessage::ping()) {
                    log::debug!("Keep-alive ping not sent: {}", e);
                }
            }
            // Surfaced by connect_backend
            ChannelEvent::Error(e) => log::debug!("Channel error: {}", e),
            ChannelEvent::Closed => log::debug!("Channel closed"),
        }
    }

    fn on_text(&self, text: &str) {
        let message = match classify(text) {
            Ok(Inbound::Control(message)) => message,
            Ok(Inbound::Signalling(action)) => {
                log::debug!("Ignoring peer signaling on the duplex path: {:?}", action);
                return;
            }
            Ok(Inbound::Internal(value)) => {
                log::debug!("Internal message: {}", value);
                return;
            }
            Err(e) => {
                self.emit(BackendEvent::Error(TransportError::Protocol(e.to_string())));
                return;
            }
        };

        match message.msg_type.as_str() {
            message_types::BOT_TTS_AUDIO => self.play_tts(&message),
            message_types::USER_STARTED_SPEAKING => {
                self.barge_in();
                self.emit(BackendEvent::Message(message));
            }
            message_types::BOT_STARTED_SPEAKING => {
                *lock(&self.utterance) = new_utterance_id();
                self.emit(BackendEvent::Message(message));
            }
            _ => self.emit(BackendEvent::Message(message)),
        }
    }

    async fn teardown(&self) {
        let channel = lock(&self.channel).take();
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(task) = lock(&self.channel_task).take() {
            task.abort();
        }

        if let Some(capture) = self.capture.lock().await.as_ref() {
            if let Err(e) = capture.pause().await {
                log::debug!("Capture not paused: {}", e);
            }
        }

        lock(&self.player).interrupt();
        *lock(&self.utterance) = new_utterance_id();
        if std::mem::replace(&mut *lock(&self.bot_track_live), false) {
            self.emit(BackendEvent::TrackStopped(TrackInfo::new(
                BOT_AUDIO_TRACK,
                MediaKind::Audio,
                Participant::Bot,
            )));
        }
        log::info!("Duplex transport torn down");
    }
}

impl Drop for WsInner {
    fn drop(&mut self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        for task in [lock(&self.channel_task).take(), lock(&self.chunk_task).take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn channel_pump(weak: Weak<WsInner>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.on_channel_event(event);
    }
}

/// Batch microphone chunks into `raw-audio-batch` messages
///
/// Chunks produced while the channel is down are discarded; audio is never
/// queued across a reconnect.
async fn forward_chunks(weak: Weak<WsInner>, mut chunks: ChunkReceiver, batch_size: usize) {
    let mut batch: Vec<AudioChunk> = Vec::with_capacity(batch_size);
    let mut sent: u64 = 0;
    let mut discarded: u64 = 0;

    while let Some(chunk) = chunks.recv().await {
        batch.push(chunk);
        if batch.len() < batch_size {
            continue;
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let open = inner.current_channel().is_some_and(|c| c.is_open());
        if !open {
            discarded += batch.len() as u64;
            batch.clear();
            if discarded % LOG_INTERVAL_BATCHES == 1 {
                log::debug!("Channel down, {} audio chunks discarded so far", discarded);
            }
            continue;
        }

        let rate = batch[0].sample_rate;
        let message = RawAudioBatch::from_chunks(batch.iter().map(|c| c.mono.as_slice()), rate);
        batch.clear();

        match inner.send_json(&message) {
            Ok(()) => {
                sent += 1;
                if sent % LOG_INTERVAL_BATCHES == 0 {
                    log::debug!("Sent {} audio batches", sent);
                }
            }
            Err(e) => log::warn!("Failed to send audio batch: {}", e),
        }
    }
    log::debug!("Microphone chunk stream ended");
}
