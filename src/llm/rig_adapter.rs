//! Bridges rig's `CompletionModel` to our `LlmProvider`.
//!
//! System messages become the preamble, the last user turn becomes the
//! prompt, and everything in between is replayed as chat history.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, ImageMediaType, Message, UserContent};
use tracing::debug;

use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, ContentPart, FinishReason, LlmProvider,
    Role,
};
use crate::error::LlmError;

/// Anthropic rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }

    fn provider(&self) -> String {
        provider_of(&self.model_name).to_string()
    }
}

fn provider_of(model_name: &str) -> &'static str {
    if model_name.starts_with("claude") {
        "anthropic"
    } else {
        "rig"
    }
}

/// Our request split the way rig's builder wants it.
#[derive(Debug)]
pub(crate) struct RigConversation {
    pub preamble: Option<String>,
    pub history: Vec<Message>,
    pub prompt: Message,
}

fn image_media_type(media_type: &str) -> Option<ImageMediaType> {
    match media_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some(ImageMediaType::JPEG),
        "image/png" => Some(ImageMediaType::PNG),
        "image/gif" => Some(ImageMediaType::GIF),
        "image/webp" => Some(ImageMediaType::WEBP),
        _ => None,
    }
}

fn user_content(part: &ContentPart) -> UserContent {
    match part {
        ContentPart::Text(text) => UserContent::text(text.clone()),
        ContentPart::Image { media_type, data } => {
            UserContent::image_base64(data.clone(), image_media_type(media_type), None)
        }
    }
}

fn to_rig_message(message: &ChatMessage, provider: &str) -> Result<Message, LlmError> {
    match message.role {
        Role::Assistant => Ok(Message::assistant(message.text())),
        Role::User | Role::System => {
            let parts: Vec<UserContent> = message.parts.iter().map(user_content).collect();
            let content = OneOrMany::many(parts).map_err(|_| LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: "message has no content".to_string(),
            })?;
            Ok(Message::User { content })
        }
    }
}

pub(crate) fn to_rig_conversation(
    messages: &[ChatMessage],
    provider: &str,
) -> Result<RigConversation, LlmError> {
    let system: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(ChatMessage::text)
        .collect();

    let mut turns = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| to_rig_message(m, provider))
        .collect::<Result<Vec<_>, _>>()?;
    let prompt = turns.pop().ok_or_else(|| LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: "request has no user or assistant messages".to_string(),
    })?;

    Ok(RigConversation {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: turns,
        prompt,
    })
}

fn map_error(err: CompletionError, provider: &str) -> LlmError {
    let reason = err.to_string();
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("429") || lowered.contains("rate_limit") || lowered.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lowered.contains("401") || lowered.contains("authentication") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        match err {
            CompletionError::ResponseError(_) | CompletionError::JsonError(_) => {
                LlmError::InvalidResponse {
                    provider: provider.to_string(),
                    reason,
                }
            }
            _ => LlmError::RequestFailed {
                provider: provider.to_string(),
                reason,
            },
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let provider = self.provider();
        let conversation = to_rig_conversation(&request.messages, &provider)?;
        debug!(
            model = %self.model_name,
            history = conversation.history.len(),
            "Completion request"
        );

        let mut builder = self
            .model
            .completion_request(conversation.prompt)
            .messages(conversation.history)
            .max_tokens(u64::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(|e| map_error(e, &provider))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let finish_reason = if content.is_empty() {
            FinishReason::Unknown
        } else {
            FinishReason::Stop
        };

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_user_parts(message: &Message) -> Vec<UserContent> {
        match message {
            Message::User { content } => content.iter().cloned().collect(),
            other => panic!("expected a user message, got {other:?}"),
        }
    }

    #[test]
    fn system_messages_become_the_preamble() {
        let conversation = to_rig_conversation(
            &[
                ChatMessage::system("be terse"),
                ChatMessage::system("answer in JSON"),
                ChatMessage::user("hello"),
            ],
            "anthropic",
        )
        .unwrap();

        assert_eq!(conversation.preamble.as_deref(), Some("be terse\n\nanswer in JSON"));
        assert!(conversation.history.is_empty());
        let parts = first_user_parts(&conversation.prompt);
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], UserContent::Text(t) if t.text == "hello"));
    }

    #[test]
    fn last_turn_is_the_prompt_and_earlier_turns_are_history() {
        let mut assistant = ChatMessage::user("earlier answer");
        assistant.role = Role::Assistant;
        let conversation = to_rig_conversation(
            &[
                ChatMessage::user("first"),
                assistant,
                ChatMessage::user("second"),
            ],
            "anthropic",
        )
        .unwrap();

        assert!(conversation.preamble.is_none());
        assert_eq!(conversation.history.len(), 2);
        assert!(matches!(conversation.history[1], Message::Assistant { .. }));
        let parts = first_user_parts(&conversation.prompt);
        assert!(matches!(&parts[0], UserContent::Text(t) if t.text == "second"));
    }

    #[test]
    fn image_parts_keep_their_order() {
        let conversation = to_rig_conversation(
            &[ChatMessage::user_with_image("image/png", "aGVsbG8=", "describe")],
            "anthropic",
        )
        .unwrap();

        let parts = first_user_parts(&conversation.prompt);
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], UserContent::Image(_)));
        assert!(matches!(&parts[1], UserContent::Text(t) if t.text == "describe"));
    }

    #[test]
    fn media_types_map_to_rig_variants() {
        assert!(matches!(image_media_type("image/jpeg"), Some(ImageMediaType::JPEG)));
        assert!(matches!(image_media_type("IMAGE/PNG"), Some(ImageMediaType::PNG)));
        assert!(matches!(image_media_type("image/webp"), Some(ImageMediaType::WEBP)));
        assert!(image_media_type("image/heic").is_none());
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = to_rig_conversation(&[ChatMessage::system("rules")], "anthropic").unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[test]
    fn provider_errors_map_to_retry_classes() {
        let limited = map_error(
            CompletionError::ProviderError("429 rate_limit_error".into()),
            "anthropic",
        );
        assert!(matches!(limited, LlmError::RateLimited { .. }));

        let auth = map_error(
            CompletionError::ProviderError("authentication_error: invalid x-api-key".into()),
            "anthropic",
        );
        assert!(matches!(auth, LlmError::AuthFailed { .. }));

        let other = map_error(
            CompletionError::ProviderError("overloaded".into()),
            "anthropic",
        );
        assert!(matches!(other, LlmError::RequestFailed { .. }));
    }
}
