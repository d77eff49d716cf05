//! Wire formats shared by both transport variants
//!
//! # Message families
//!
//! - Control envelopes `{ id, label: "rtvi-ai", type, data }`, the only
//!   messages dispatched to the host application
//! - Signaling messages `{ type: "signalling", message }` on the peer data channel
//! - Offer/answer bodies for the HTTP signaling endpoint
//! - `raw-audio-batch` frames carrying base64 PCM16 microphone audio

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed label carried by every application-level envelope
pub const RTVI_LABEL: &str = "rtvi-ai";

/// Envelope types the core itself reacts to
pub mod message_types {
    pub const CLIENT_READY: &str = "client-ready";
    pub const BOT_READY: &str = "bot-ready";
    pub const USER_STARTED_SPEAKING: &str = "user-started-speaking";
    pub const BOT_STARTED_SPEAKING: &str = "bot-started-speaking";
    pub const BOT_TTS_AUDIO: &str = "bot-tts-audio";
    pub const AUDIO_TRUNCATED: &str = "audio-truncated";
    pub const PING: &str = "ping";
    pub const ERROR: &str = "error";
}

/// Application-level control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
}

impl ControlMessage {
    /// Build an envelope with a fresh id and the fixed label
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: RTVI_LABEL.to_string(),
            msg_type: msg_type.into(),
            data,
        }
    }

    pub fn client_ready() -> Self {
        Self::new(
            message_types::CLIENT_READY,
            serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        )
    }

    pub fn ping() -> Self {
        Self::new(message_types::PING, Value::Null)
    }

    /// Tell the remote how much of an utterance the user actually heard
    pub fn audio_truncated(utterance_id: &str, sample_offset: u64) -> Self {
        Self::new(
            message_types::AUDIO_TRUNCATED,
            serde_json::json!({ "utteranceId": utterance_id, "sampleOffset": sample_offset }),
        )
    }

    pub fn is_rtvi(&self) -> bool {
        self.label == RTVI_LABEL
    }

    pub fn is_type(&self, msg_type: &str) -> bool {
        self.msg_type == msg_type
    }
}

/// Action requested by a signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum SignallingAction {
    Renegotiate,
    PeerLeft,
    Unknown(String),
}

/// `message` is either a bare string or an object with a `type` field
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SignallingBody {
    Name(String),
    Tagged {
        #[serde(rename = "type")]
        kind: String,
    },
}

impl From<SignallingBody> for SignallingAction {
    fn from(body: SignallingBody) -> Self {
        let name = match body {
            SignallingBody::Name(name) => name,
            SignallingBody::Tagged { kind } => kind,
        };
        match name.as_str() {
            "renegotiate" => SignallingAction::Renegotiate,
            "peerLeft" => SignallingAction::PeerLeft,
            _ => SignallingAction::Unknown(name),
        }
    }
}

/// Outgoing signaling message (`{ type: "signalling", message }`)
#[derive(Debug, Clone, Serialize)]
pub struct SignallingMessage {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub message: String,
}

impl SignallingMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            msg_type: "signalling",
            message: message.into(),
        }
    }
}

/// Classification of an inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Envelope with the fixed label; forwarded to the application
    Control(ControlMessage),
    /// Peer-path signaling; handled internally
    Signalling(SignallingAction),
    /// Anything else; internal, never forwarded
    Internal(Value),
}

/// Parse and classify an inbound text frame
pub fn classify(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;

    if value.get("type").and_then(Value::as_str) == Some("signalling") {
        if let Some(body) = value.get("message") {
            let body: SignallingBody = serde_json::from_value(body.clone())?;
            return Ok(Inbound::Signalling(body.into()));
        }
    }

    if value.get("label").and_then(Value::as_str) == Some(RTVI_LABEL) {
        let msg: ControlMessage = serde_json::from_value(value)?;
        return Ok(Inbound::Control(msg));
    }

    Ok(Inbound::Internal(value))
}

// ============================================================================
// Offer / answer (HTTP signaling)
// ============================================================================

/// Offer posted to the signaling endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub restart: bool,
}

/// Answer returned by the signaling endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(default)]
    pub connection_id: Option<String>,
}

// ============================================================================
// Audio payloads (duplex path)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAudioBatchData {
    pub base64_audio_batch: Vec<String>,
    pub sample_rate: u32,
    pub num_channels: u16,
}

/// `{ type: "raw-audio-batch", data: {...} }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAudioBatch {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: RawAudioBatchData,
}

impl RawAudioBatch {
    /// Encode mono PCM16 chunks as one batch message
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a [i16]>, sample_rate: u32) -> Self {
        Self {
            msg_type: "raw-audio-batch".to_string(),
            data: RawAudioBatchData {
                base64_audio_batch: chunks.into_iter().map(encode_pcm16).collect(),
                sample_rate,
                num_channels: 1,
            },
        }
    }
}

/// Data of a `bot-tts-audio` envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotAudio {
    pub id: String,
    pub audio: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

/// Base64 of little-endian PCM16
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

pub fn decode_pcm16(encoded: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = STANDARD.decode(encoded)?;
    Ok(pcm16_from_le_bytes(&bytes))
}

/// A trailing odd byte is dropped
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
