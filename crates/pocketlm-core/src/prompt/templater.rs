use std::path::PathBuf;

use minijinja::value::{Value, ValueKind, from_args};
use minijinja::{Environment, ErrorKind, context};
use pocketlm_types::{ChatMessage, Role, messages_json};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::family::{FamilyTable, TemplateStrategy};
use super::formats;
use crate::engine::{EngineError, EngineSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplaterConfig {
    /// Injected when a conversation has no system message.
    pub default_system_prompt: String,
    /// Serialized histories larger than this skip the embedded template.
    pub native_payload_limit_bytes: usize,
    /// Embedded-template output shorter than this is treated as corrupt.
    pub min_output_chars: usize,
    pub families: FamilyTable,
}

impl Default for TemplaterConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: "You are a helpful assistant.".to_owned(),
            native_payload_limit_bytes: 8 * 1024,
            min_output_chars: 16,
            families: FamilyTable::default(),
        }
    }
}

/// What the templater knows about the loaded model.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub name: String,
    pub family_hint: String,
    pub path: Option<PathBuf>,
    /// Jinja chat template from the GGUF metadata.
    pub chat_template: Option<String>,
}

/// Which rung of the ladder produced a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PromptSource {
    /// The engine applied the embedded template.
    Native,
    /// The embedded template, rendered here.
    Embedded,
    Family(TemplateStrategy),
    Generic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub text: String,
    pub source: PromptSource,
}

/// Why the embedded template was not used. Never surfaced to callers; the
/// ladder falls through to the next rung.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("could not serialize messages: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("payload of {bytes} bytes exceeds the {limit}-byte limit")]
    TooLarge { bytes: usize, limit: usize },

    #[error("engine failed to apply template: {0}")]
    Engine(#[from] EngineError),

    #[error("template did not render: {0}")]
    Render(#[from] minijinja::Error),

    #[error("output rejected: {0}")]
    Rejected(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct Templater {
    config: TemplaterConfig,
}

impl Templater {
    pub fn new(config: TemplaterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TemplaterConfig {
        &self.config
    }

    /// Render `messages` for the model described by `meta`.
    ///
    /// `native` is the loaded session, used to apply the embedded template
    /// when the engine supports it.
    pub fn format(
        &self,
        messages: &[ChatMessage],
        meta: &ModelMetadata,
        native: Option<&dyn EngineSession>,
    ) -> RenderedPrompt {
        let messages = self.with_system(messages);

        if let Some(template) = meta.chat_template.as_deref() {
            match self.embedded(&messages, template, native) {
                Ok(prompt) => return prompt,
                Err(e) => debug!(model = %meta.name, reason = %e, "embedded chat template skipped"),
            }
        }

        let path = meta
            .path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let haystacks = [meta.name.as_str(), meta.family_hint.as_str(), path.as_str()];
        if let Some(strategy) = self.config.families.detect(haystacks) {
            return RenderedPrompt {
                text: formats::render(strategy, &messages),
                source: PromptSource::Family(strategy),
            };
        }

        RenderedPrompt {
            text: formats::render(TemplateStrategy::ChatMl, &messages),
            source: PromptSource::Generic,
        }
    }

    /// `messages` with the default system prompt prepended when it has none.
    pub fn with_system(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if messages.iter().any(|m| m.role == Role::System) {
            return messages.to_vec();
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(ChatMessage::system(self.config.default_system_prompt.clone()));
        out.extend_from_slice(messages);
        out
    }

    fn embedded(
        &self,
        messages: &[ChatMessage],
        template: &str,
        native: Option<&dyn EngineSession>,
    ) -> Result<RenderedPrompt, TemplateError> {
        let payload = messages_json(messages)?;
        if payload.len() > self.config.native_payload_limit_bytes {
            return Err(TemplateError::TooLarge {
                bytes: payload.len(),
                limit: self.config.native_payload_limit_bytes,
            });
        }

        let native_result = match native {
            Some(session) => match session.apply_chat_template(&payload, true) {
                Ok(text) => Some(text),
                Err(EngineError::Unsupported(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let (text, source) = match native_result {
            Some(text) => (text, PromptSource::Native),
            None => (render_jinja(template, messages)?, PromptSource::Embedded),
        };

        validate(&text, messages, self.config.min_output_chars)?;
        Ok(RenderedPrompt { text, source })
    }
}

/// Reject template output showing known corruption signatures.
pub fn validate(text: &str, messages: &[ChatMessage], min_chars: usize) -> Result<(), TemplateError> {
    if text.trim().chars().count() < min_chars {
        return Err(TemplateError::Rejected("output implausibly short"));
    }
    if text.contains('\u{FFFD}') || text.contains('\0') {
        return Err(TemplateError::Rejected("replacement or NUL characters"));
    }

    for m in messages {
        let prefix: String = m.content.trim().chars().take(8).collect();
        if prefix.is_empty() {
            continue;
        }
        // `<|im_start|>userHello`: role marker fused to content.
        let glued = [">", "|"]
            .iter()
            .any(|close| text.contains(&format!("{close}{}{prefix}", m.role)));
        if glued {
            return Err(TemplateError::Rejected("role marker glued to content"));
        }
    }

    if let Some(latest) = messages.iter().rev().find(|m| m.role != Role::System) {
        let needle: String = latest.content.trim().chars().take(32).collect();
        if !needle.is_empty() && !text.contains(&needle) {
            return Err(TemplateError::Rejected("latest message missing"));
        }
    }
    Ok(())
}

fn render_jinja(template: &str, messages: &[ChatMessage]) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_lstrip_blocks(true);
    env.set_trim_blocks(true);
    env.add_template("chat_template", template)?;
    env.add_function("raise_exception", raise_exception);

    env.set_unknown_method_callback(|state, value, method, args| match (value.kind(), method) {
        (ValueKind::String, "strip") => {
            let _: () = from_args(args)?;
            Ok(Value::from(value.as_str().unwrap_or("").trim()))
        }
        (ValueKind::Map, "items") => {
            let _: () = from_args(args)?;
            state.apply_filter("items", &[value.clone()])
        }
        _ => Err(minijinja::Error::new(
            ErrorKind::UnknownMethod,
            format!("object has no method named {method}"),
        )),
    });

    env.get_template("chat_template")?.render(context! {
        messages => messages,
        add_generation_prompt => true,
        bos_token => "",
        eos_token => "",
    })
}

fn raise_exception(msg: String) -> Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
}
