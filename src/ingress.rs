use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::candidates::{is_valid_model_id, ModelChoice};
use crate::constants::{
    DEFAULT_MAX_CHUNKS, DEFAULT_MAX_CHUNKS_LONG, MAX_CHUNKS_CEILING, MAX_TIMEOUT_MS,
    MIN_TIMEOUT_MS,
};
use crate::language::Lang;
use crate::types::*;

const MAX_MESSAGES: usize = 1000;
const MAX_PARTS_PER_MESSAGE: usize = 100;

/// Caller-facing request body.
#[derive(Deserialize, Serialize, Debug, Default, Clone)]
pub struct InboundRequest {
    #[serde(default)]
    pub messages: Option<Vec<RawMessage>>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub force_lang: Option<String>,
    #[serde(default)]
    pub guard_level: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub long: bool,
    #[serde(default)]
    pub max_chunks: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub include_raw: bool,
    #[serde(default)]
    pub expect: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RawMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<RawContent>,
    #[serde(default)]
    pub images: Vec<RawAttachment>,
    #[serde(default)]
    pub audio: Option<RawAttachment>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum RawContent {
    String(String),
    Parts(Vec<RawContentPart>),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum RawContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: RawImageUrl },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RawImageUrl {
    pub url: String,
}

/// Either a `data:` URL or an object carrying the mime type and base64 payload.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum RawAttachment {
    DataUrl(String),
    Inline {
        #[serde(default, alias = "mimeType", alias = "mime")]
        mime_type: Option<String>,
        data: String,
    },
}

/// Everything the broker needs from the request besides the conversation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub model: ModelChoice,
    pub mode: Mode,
    pub forced_lang: Option<Lang>,
    pub guard_level: GuardLevel,
    pub stream: bool,
    pub long: bool,
    pub max_chunks: u32,
    pub timeout: Duration,
    pub include_raw: bool,
    pub expect_json: bool,
}

impl RequestOptions {
    pub fn preferences(&self) -> GenerationPreferences {
        GenerationPreferences::for_request(self.mode, self.long, self.expect_json)
    }
}

impl InboundRequest {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParleyError::InvalidRequest("Request body is empty".into()).into());
        }
        let raw: InboundRequest = serde_json::from_slice(body).map_err(|e| {
            ParleyError::InvalidRequest(format!("Payload deserialization failed: {}", e))
        })?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(messages) = &self.messages {
            if messages.len() > MAX_MESSAGES {
                return Err(ParleyError::InvalidRequest(format!(
                    "Conversation exceeds limit of {} messages",
                    MAX_MESSAGES
                ))
                .into());
            }
            for (i, msg) in messages.iter().enumerate() {
                if let Some(RawContent::Parts(parts)) = &msg.content {
                    if parts.len() > MAX_PARTS_PER_MESSAGE {
                        return Err(ParleyError::InvalidRequest(format!(
                            "Message {} exceeds part limit of {}",
                            i, MAX_PARTS_PER_MESSAGE
                        ))
                        .into());
                    }
                }
            }
        }

        if let ModelChoice::Explicit(model) = ModelChoice::parse(self.model.as_deref()) {
            if !is_valid_model_id(&model) {
                return Err(ParleyError::InvalidRequest(format!(
                    "Invalid model '{}': only letters, digits, '.', '_' and '-' are allowed",
                    model
                ))
                .into());
            }
        }

        if let Some(lang) = &self.force_lang {
            if !lang.trim().is_empty() && Lang::parse(Some(lang)).is_none() {
                return Err(ParleyError::InvalidRequest(format!(
                    "Unsupported force_lang '{}': expected 'ar' or 'en'",
                    lang
                ))
                .into());
            }
        }

        Ok(())
    }

    pub fn options(&self, default_timeout: Duration) -> RequestOptions {
        let mode = Mode::parse(self.mode.as_deref());
        let default_chunks = if self.long {
            DEFAULT_MAX_CHUNKS_LONG
        } else {
            DEFAULT_MAX_CHUNKS
        };
        let timeout = match self.timeout_ms {
            Some(ms) => Duration::from_millis(ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)),
            None => default_timeout,
        };
        let expect_json = self
            .expect
            .as_deref()
            .map(|e| e.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        RequestOptions {
            model: ModelChoice::parse(self.model.as_deref()),
            mode,
            forced_lang: Lang::parse(self.force_lang.as_deref()),
            guard_level: GuardLevel::parse(self.guard_level.as_deref()),
            stream: self.stream,
            long: self.long,
            max_chunks: self
                .max_chunks
                .unwrap_or(default_chunks)
                .clamp(1, MAX_CHUNKS_CEILING),
            timeout,
            include_raw: self.include_raw,
            expect_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_prompt_request() {
        let req = InboundRequest::parse(br#"{"prompt":"hello","model":"auto"}"#).unwrap();
        let opts = req.options(Duration::from_secs(30));
        assert_eq!(opts.model, ModelChoice::Auto);
        assert_eq!(opts.mode, Mode::Default);
        assert_eq!(opts.max_chunks, DEFAULT_MAX_CHUNKS);
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert!(!opts.stream);
    }

    #[test]
    fn clamps_caller_tunables() {
        let req = InboundRequest::parse(
            br#"{"prompt":"x","max_chunks":50,"timeout_ms":10,"long":true,"expect":"JSON"}"#,
        )
        .unwrap();
        let opts = req.options(Duration::from_secs(30));
        assert_eq!(opts.max_chunks, MAX_CHUNKS_CEILING);
        assert_eq!(opts.timeout, Duration::from_millis(MIN_TIMEOUT_MS));
        assert!(opts.expect_json);
        assert!(opts.preferences().wants_json());

        let long_default = InboundRequest::parse(br#"{"prompt":"x","long":true}"#).unwrap();
        assert_eq!(
            long_default.options(Duration::from_secs(1)).max_chunks,
            DEFAULT_MAX_CHUNKS_LONG
        );
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(InboundRequest::parse(b"").is_err());
        assert!(InboundRequest::parse(b"{not json").is_err());
        assert!(InboundRequest::parse(br#"{"messages":"nope"}"#).is_err());
        assert!(InboundRequest::parse(br#"{"prompt":"x","force_lang":"fr"}"#).is_err());
    }

    #[test]
    fn rejects_model_ids_that_would_escape_the_url_path() {
        for bad in ["../v1/files", "m?key=x", "m:streamGenerateContent", "m/x", "m x"] {
            let body = serde_json::json!({"prompt": "x", "model": bad}).to_string();
            assert!(InboundRequest::parse(body.as_bytes()).is_err(), "accepted {}", bad);
        }
        let ok = InboundRequest::parse(br#"{"prompt":"x","model":"gemini-2.5-flash_001"}"#).unwrap();
        assert_eq!(
            ok.options(Duration::from_secs(1)).model,
            ModelChoice::Explicit("gemini-2.5-flash_001".into())
        );
    }

    #[test]
    fn accepts_structured_messages_with_media() {
        let body = br#"{
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "what is this?"}],
                 "images": ["data:image/png;base64,aGVsbG8="],
                 "audio": {"mimeType": "audio/wav", "data": "aGVsbG8="}}
            ],
            "mode": "image_brief"
        }"#;
        let req = InboundRequest::parse(body).unwrap();
        let messages = req.messages.as_ref().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].images.len(), 1);
        assert!(matches!(
            messages[1].audio,
            Some(RawAttachment::Inline { .. })
        ));
        assert_eq!(req.options(Duration::from_secs(1)).mode, Mode::ImageBrief);
    }
}
