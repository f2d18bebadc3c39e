use crate::constants::EMPTY_REQUEST_PLACEHOLDER;
use crate::guardrails::guardrail_block;
use crate::ingress::*;
use crate::language::{self, Lang};
use crate::media::MediaFilter;
use crate::types::*;

/// Conversation ready for projection onto the upstream wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConversation {
    pub turns: Vec<ConversationTurn>,
    pub lang: Lang,
    pub dropped_attachments: usize,
}

pub struct ParleyEngine;

impl ParleyEngine {
    /// Never fails and never yields an empty conversation.
    pub fn normalize(request: &InboundRequest, options: &RequestOptions) -> NormalizedConversation {
        let mut filter = MediaFilter::new();
        let mut turns = Self::lift_turns(request, &mut filter);

        if turns.is_empty() {
            let fallback = request
                .system
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(EMPTY_REQUEST_PLACEHOLDER);
            tracing::debug!("[⚙️] Request carried no usable turns; manufacturing fallback turn");
            turns.push(ConversationTurn::user(fallback));
        } else {
            if let Some(system) = request.system.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                turns.insert(0, ConversationTurn::text(Role::System, system));
            }
            if !turns.iter().any(|t| t.role == Role::User) {
                turns.push(ConversationTurn::user(EMPTY_REQUEST_PLACEHOLDER));
            }
        }

        let user_text = turns
            .iter()
            .filter(|t| t.role == Role::User)
            .map(ConversationTurn::joined_text)
            .collect::<Vec<_>>()
            .join("\n");
        let lang = language::resolve(options.forced_lang, &user_text);

        let block = guardrail_block(
            lang,
            options.guard_level,
            options.mode,
            options.preferences().wants_json(),
        );
        Self::inject_guardrail(&mut turns, block);

        NormalizedConversation {
            turns,
            lang,
            dropped_attachments: filter.rejected(),
        }
    }

    fn lift_turns(request: &InboundRequest, filter: &mut MediaFilter) -> Vec<ConversationTurn> {
        match request.messages.as_deref() {
            Some(messages) if !messages.is_empty() => messages
                .iter()
                .filter_map(|msg| Self::lift_message(msg, filter))
                .collect(),
            _ => request
                .prompt
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| vec![ConversationTurn::user(p)])
                .unwrap_or_default(),
        }
    }

    fn lift_message(msg: &RawMessage, filter: &mut MediaFilter) -> Option<ConversationTurn> {
        let role = Role::from_loose(msg.role.as_deref());
        let mut segments = Vec::new();
        let mut images: Vec<RawAttachment> = Vec::new();

        match &msg.content {
            Some(RawContent::String(text)) => push_text(&mut segments, text),
            Some(RawContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        RawContentPart::Text { text } => push_text(&mut segments, text),
                        RawContentPart::ImageUrl { image_url } => {
                            images.push(RawAttachment::DataUrl(image_url.url.clone()))
                        }
                        RawContentPart::Unknown => {
                            tracing::debug!("[⚙️] Skipping unsupported content part");
                        }
                    }
                }
            }
            None => {}
        }

        images.extend(msg.images.iter().cloned());
        segments.extend(filter.accept_images(&images));
        if let Some(audio) = filter.accept_audio(msg.audio.as_ref()) {
            segments.push(audio);
        }

        if segments.is_empty() {
            return None;
        }
        Some(ConversationTurn { role, segments })
    }

    /// Prefixes `block` onto the first user turn only.
    fn inject_guardrail(turns: &mut [ConversationTurn], block: String) {
        let Some(turn) = turns.iter_mut().find(|t| t.role == Role::User) else {
            return;
        };
        match turn.segments.first_mut() {
            Some(Segment::Text { text }) => {
                *text = format!("{}\n\n{}", block, text);
            }
            _ => turn.segments.insert(0, Segment::Text { text: block }),
        }
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.trim().is_empty() {
        segments.push(Segment::Text {
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::GUARDRAIL_HEADER;
    use std::time::Duration;

    fn normalize(body: &str) -> NormalizedConversation {
        let req = InboundRequest::parse(body.as_bytes()).unwrap();
        let opts = req.options(Duration::from_secs(30));
        ParleyEngine::normalize(&req, &opts)
    }

    fn guardrail_count(conv: &NormalizedConversation) -> usize {
        conv.turns
            .iter()
            .map(|t| t.joined_text().matches(GUARDRAIL_HEADER).count())
            .sum()
    }

    #[test]
    fn empty_request_yields_placeholder_turn() {
        let conv = normalize("{}");
        assert_eq!(conv.turns.len(), 1);
        assert_eq!(conv.turns[0].role, Role::User);
        assert!(conv.turns[0].joined_text().ends_with(EMPTY_REQUEST_PLACEHOLDER));
        assert_eq!(guardrail_count(&conv), 1);
    }

    #[test]
    fn system_string_becomes_fallback_turn() {
        let conv = normalize(r#"{"system":"Introduce yourself","messages":[{"role":"user","content":"   "}]}"#);
        assert_eq!(conv.turns.len(), 1);
        assert!(conv.turns[0].joined_text().ends_with("Introduce yourself"));
    }

    #[test]
    fn guardrail_lands_on_first_user_turn_only() {
        let conv = normalize(
            r#"{"messages":[
                {"role":"system","content":"be brief"},
                {"role":"user","content":"first"},
                {"role":"assistant","content":"ok"},
                {"role":"user","content":"second"}
            ]}"#,
        );
        assert_eq!(conv.turns.len(), 4);
        assert_eq!(guardrail_count(&conv), 1);
        assert!(conv.turns[1].joined_text().starts_with(GUARDRAIL_HEADER));
        assert!(conv.turns[1].joined_text().ends_with("first"));
        assert_eq!(conv.turns[3].joined_text(), "second");
    }

    #[test]
    fn assistant_only_history_gets_a_user_turn() {
        let conv = normalize(r#"{"messages":[{"role":"assistant","content":"hello there"}]}"#);
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.turns[1].role, Role::User);
        assert_eq!(guardrail_count(&conv), 1);
    }

    #[test]
    fn unknown_roles_and_bad_media_are_tolerated() {
        let conv = normalize(
            r#"{"messages":[
                {"role":"tool","content":"result"},
                {"role":"user","content":null,"images":["data:image/gif;base64,R0lGOD=="]}
            ]}"#,
        );
        assert_eq!(conv.turns.len(), 1);
        assert_eq!(conv.turns[0].role, Role::User);
        assert_eq!(conv.dropped_attachments, 1);
    }

    #[test]
    fn image_only_turn_gets_guardrail_segment_in_front() {
        let conv = normalize(
            r#"{"mode":"image_brief","messages":[
                {"role":"user","images":["data:image/png;base64,aGVsbG8="]}
            ]}"#,
        );
        let turn = &conv.turns[0];
        assert_eq!(turn.segments.len(), 2);
        assert!(matches!(&turn.segments[0], Segment::Text { text } if text.starts_with(GUARDRAIL_HEADER)));
        assert_eq!(turn.attachment_count(), 1);
    }

    #[test]
    fn language_follows_user_text_unless_forced() {
        assert_eq!(normalize(r#"{"prompt":"ما هي عاصمة مصر؟"}"#).lang, Lang::Ar);
        assert_eq!(
            normalize(r#"{"prompt":"ما هي عاصمة مصر؟","force_lang":"en"}"#).lang,
            Lang::En
        );
    }
}
