//! # Relay Wire Protocol
//!
//! Message types exchanged on both sides of the relay.
//!
//! ## Client Protocol (browser ↔ relay, JSON text frames):
//! - **Client → Server**: `audio` (base64 or byte-array payload + last-chunk flag), `config` (language pair)
//! - **Server → Client**: `connection`, `config_updated`, `results`, `final_results`, `error`
//!
//! ## Upstream Protocol (relay ↔ recognition service):
//! - **Relay → Upstream**: binary PCM frames
//! - **Upstream → Relay**: JSON envelopes `{errorCode, errorMessage?, end, result: {context, tranContent}}`

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Source/target language pair for one relay session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePair {
    pub from: String,
    pub to: String,
}

impl LanguagePair {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Audio as the client sent it.
///
/// Browsers usually base64-encode PCM chunks into the JSON frame; a plain
/// JSON byte array or a binary WebSocket frame is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Encoded(String),
    Raw(Vec<u8>),
}

impl AudioPayload {
    /// Decode to the bytes that go upstream.
    ///
    /// Returns `None` for empty payloads and for text that is not valid base64.
    pub fn decode(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            AudioPayload::Encoded(text) if text.is_empty() => return None,
            AudioPayload::Encoded(text) => STANDARD.decode(text.trim()).ok()?,
            AudioPayload::Raw(bytes) => bytes.clone(),
        };

        if bytes.is_empty() {
            None
        } else {
            Some(bytes)
        }
    }
}

/// Partial language update from a `config` message; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LanguageUpdate {
    pub from: Option<String>,
    pub to: Option<String>,
}

impl LanguageUpdate {
    /// Resolve against the languages currently in use.
    pub fn resolve(&self, current: &LanguagePair) -> LanguagePair {
        LanguagePair {
            from: self.from.clone().unwrap_or_else(|| current.from.clone()),
            to: self.to.clone().unwrap_or_else(|| current.to.clone()),
        }
    }
}

/// Messages a browser client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// One chunk of captured audio. A missing or null `data` is ignored.
    Audio {
        #[serde(default)]
        data: Option<AudioPayload>,
        #[serde(default)]
        is_last: bool,
    },

    /// New source/target language pair
    Config {
        #[serde(default)]
        data: LanguageUpdate,
    },
}

/// Why a client text frame could not be turned into a `ClientRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON at all
    InvalidJson,
    /// JSON, but not a message we understand
    Unsupported(String),
}

impl DecodeError {
    /// Text for the client-facing `error` event.
    pub fn client_message(&self) -> String {
        match self {
            DecodeError::InvalidJson => "invalid JSON format".to_string(),
            DecodeError::Unsupported(detail) => format!("error processing message: {}", detail),
        }
    }
}

/// Decode one client text frame.
///
/// Parsing happens in two steps so that malformed JSON and well-formed but
/// unknown messages produce different error events.
pub fn decode_client_message(text: &str) -> Result<ClientRequest, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| DecodeError::InvalidJson)?;

    serde_json::from_value(value).map_err(|e| DecodeError::Unsupported(e.to_string()))
}

/// Recognition/translation text pair carried by result events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultPayload {
    pub recognition: String,
    pub translation: String,
}

/// Outcome of translating one upstream envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultEvent {
    Partial(ResultPayload),
    Final(ResultPayload),
    Error(String),
}

/// Messages the relay sends to a browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Acknowledgment sent once per accepted connection
    Connection { status: String, client_id: String },

    /// Language pair change has been applied
    ConfigUpdated { data: LanguagePair },

    /// Partial (still changing) recognition result
    Results { data: ResultPayload },

    /// Final result for the current sentence
    FinalResults { data: ResultPayload },

    /// Anything the client should know went wrong
    Error { message: String },
}

impl ClientEvent {
    pub fn connected(client_id: impl Into<String>) -> Self {
        ClientEvent::Connection {
            status: "connected".to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClientEvent::Error {
            message: message.into(),
        }
    }

    /// Serialize for a WebSocket text frame.
    pub fn to_json(&self) -> String {
        // Every variant is plain strings, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<ResultEvent> for ClientEvent {
    fn from(event: ResultEvent) -> Self {
        match event {
            ResultEvent::Partial(data) => ClientEvent::Results { data },
            ResultEvent::Final(data) => ClientEvent::FinalResults { data },
            ResultEvent::Error(message) => ClientEvent::Error { message },
        }
    }
}

/// Envelope emitted by the upstream service for every recognition update.
///
/// The vendor is loose with types: `errorCode` arrives as `"0"` or `0`, and
/// `end` has been seen both as a bool and as `"true"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamEnvelope {
    #[serde(default, deserialize_with = "string_or_number")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub end: bool,
    #[serde(default)]
    pub result: Option<UpstreamResult>,
}

/// Recognized source text and its translation.
/// Either field may be absent or null.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamResult {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub tran_content: Option<String>,
}

/// Why an upstream frame produced no client event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    NotJson(String),

    #[error("success envelope has no result object")]
    MissingResult,
}

impl UpstreamEnvelope {
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|e| EnvelopeError::NotJson(e.to_string()))
    }

    /// Map the envelope onto a result event.
    ///
    /// A missing error code counts as an error, the same as any non-"0" code.
    pub fn into_event(self) -> Result<ResultEvent, EnvelopeError> {
        if self.error_code.as_deref() != Some("0") {
            let message = self
                .error_message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "unknown error".to_string());
            return Ok(ResultEvent::Error(message));
        }

        let result = self.result.ok_or(EnvelopeError::MissingResult)?;
        let payload = ResultPayload {
            recognition: result.context.unwrap_or_default(),
            translation: result.tran_content.unwrap_or_default(),
        };

        Ok(if self.end {
            ResultEvent::Final(payload)
        } else {
            ResultEvent::Partial(payload)
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}
