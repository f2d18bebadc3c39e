//! Attachment validation. Rejected attachments are dropped, never surfaced as errors.

use base64::Engine;

use crate::constants::{
    AUDIO_MIME_TYPES, IMAGE_MIME_TYPES, MAX_ATTACHMENT_BYTES, MAX_IMAGES_PER_MESSAGE,
    MAX_INLINE_BYTES_PER_REQUEST,
};
use crate::ingress::RawAttachment;
use crate::types::Segment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Malformed,
    UnsupportedMime(String),
    InvalidBase64,
    TooLarge(usize),
    OverRequestBudget,
    TooManyImages,
}

/// Tracks the inline byte budget across every attachment of one request.
#[derive(Debug, Default)]
pub struct MediaFilter {
    used_bytes: usize,
    rejected: usize,
}

impl MediaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn accept_images(&mut self, images: &[RawAttachment]) -> Vec<Segment> {
        let mut accepted = Vec::new();
        for raw in images {
            if accepted.len() >= MAX_IMAGES_PER_MESSAGE {
                self.reject(Rejection::TooManyImages);
                continue;
            }
            match self.accept(raw, IMAGE_MIME_TYPES) {
                Ok(segment) => accepted.push(segment),
                Err(rejection) => self.reject(rejection),
            }
        }
        accepted
    }

    pub fn accept_audio(&mut self, audio: Option<&RawAttachment>) -> Option<Segment> {
        let raw = audio?;
        match self.accept(raw, AUDIO_MIME_TYPES) {
            Ok(segment) => Some(segment),
            Err(rejection) => {
                self.reject(rejection);
                None
            }
        }
    }

    fn reject(&mut self, rejection: Rejection) {
        self.rejected += 1;
        tracing::debug!("[📎] Dropping attachment: {:?}", rejection);
    }

    fn accept(
        &mut self,
        raw: &RawAttachment,
        allowed: &[&str],
    ) -> std::result::Result<Segment, Rejection> {
        let (mime, data) = split_attachment(raw).ok_or(Rejection::Malformed)?;
        let mime = normalize_mime(&mime);
        if !allowed.contains(&mime.as_str()) {
            return Err(Rejection::UnsupportedMime(mime));
        }

        let data: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let estimated = data.len() / 4 * 3;
        if estimated > MAX_ATTACHMENT_BYTES + 3 {
            return Err(Rejection::TooLarge(estimated));
        }
        let decoded_len = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|_| Rejection::InvalidBase64)?
            .len();
        if decoded_len == 0 {
            return Err(Rejection::Malformed);
        }
        if decoded_len > MAX_ATTACHMENT_BYTES {
            return Err(Rejection::TooLarge(decoded_len));
        }
        if self.used_bytes + decoded_len > MAX_INLINE_BYTES_PER_REQUEST {
            return Err(Rejection::OverRequestBudget);
        }

        self.used_bytes += decoded_len;
        Ok(Segment::Attachment {
            mime_type: mime,
            data,
        })
    }
}

fn split_attachment(raw: &RawAttachment) -> Option<(String, String)> {
    match raw {
        RawAttachment::DataUrl(url) => parse_data_url(url),
        RawAttachment::Inline { mime_type, data } => {
            let mime = mime_type.as_deref()?.to_string();
            let data = match parse_data_url(data) {
                Some((_, payload)) => payload,
                None => data.clone(),
            };
            Some((mime, data))
        }
    }
}

/// `data:<mime>;base64,<payload>`
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.trim().strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    if mime.is_empty() {
        return None;
    }
    Some((mime.to_string(), payload.to_string()))
}

fn normalize_mime(mime: &str) -> String {
    let lower = mime.trim().to_ascii_lowercase();
    match lower.as_str() {
        "image/jpg" => "image/jpeg".to_string(),
        "audio/x-wav" | "audio/wave" => "audio/wav".to_string(),
        _ => lower,
    }
}
