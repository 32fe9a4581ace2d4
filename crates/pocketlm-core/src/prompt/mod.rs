//! Conversation → literal prompt text.
//!
//! The ladder: the model's embedded chat template (applied natively or
//! rendered with minijinja, then validated), a family layout picked from a
//! keyword table, and finally generic ChatML.

mod family;
mod formats;
mod templater;
mod truncate;

pub use family::{FamilyRule, FamilyTable, TemplateStrategy};
pub use formats::render as render_family;
pub use templater::{
    ModelMetadata, PromptSource, RenderedPrompt, TemplateError, Templater, TemplaterConfig, validate,
};
pub use truncate::{Truncation, content_len, drop_oldest_turn, keep_latest};
