//! Background compression of older conversation history.
//!
//! After a turn the host calls [`Summarizer::maybe_summarize`]. When the
//! conversation has grown by another block of messages, a job is spawned that
//! asks the loaded model for a short synopsis of everything except the recent
//! tail and stores it. Nothing here ever fails the caller: errors end up in
//! the log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pocketlm_types::{ChatMessage, ConversationSummary, Role};
use pocketlm_utils::TaskRegistry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::engine::GenerateOptions;
use crate::session::{ModelHost, SessionError};

const INSTRUCTION: &str = "You condense chat transcripts. Reply with one terse synopsis of the \
conversation below: who wants what, decisions made and facts worth remembering. No preamble.";

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("no model is loaded")]
    NoModel,

    #[error("a foreground generation is running")]
    Busy,

    #[error("model returned an empty summary")]
    Empty,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("could not store summary: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Summarize whenever the history length is a positive multiple of this.
    pub trigger_every: usize,
    /// Most recent messages left out of the summary input.
    pub keep_recent: usize,
    /// At most this many older messages are fed in.
    pub max_input_messages: usize,
    pub per_message_chars: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_summary_chars: usize,
    pub deadline_ms: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            trigger_every: 8,
            keep_recent: 8,
            max_input_messages: 12,
            per_message_chars: 280,
            temperature: 0.2,
            max_tokens: 128,
            max_summary_chars: 400,
            deadline_ms: 60_000,
        }
    }
}

impl SummarizerConfig {
    pub fn should_trigger(&self, history_len: usize) -> bool {
        self.trigger_every > 0 && history_len >= self.trigger_every && history_len % self.trigger_every == 0
    }
}

/// Where summaries are kept between turns.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn get(&self, chat_id: &str) -> Option<ConversationSummary>;

    async fn put(&self, summary: ConversationSummary) -> Result<(), SummarizeError>;
}

#[derive(Debug, Default)]
pub struct InMemorySummaryStore {
    summaries: RwLock<HashMap<String, ConversationSummary>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.summaries.read().await.len()
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn get(&self, chat_id: &str) -> Option<ConversationSummary> {
        self.summaries.read().await.get(chat_id).cloned()
    }

    async fn put(&self, summary: ConversationSummary) -> Result<(), SummarizeError> {
        self.summaries
            .write()
            .await
            .insert(summary.chat_id.clone(), summary);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Summarizer {
    host: Arc<ModelHost>,
    store: Arc<dyn SummaryStore>,
    jobs: TaskRegistry,
    config: SummarizerConfig,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("config", &self.config)
            .field("running", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl Summarizer {
    pub fn new(host: Arc<ModelHost>, store: Arc<dyn SummaryStore>, config: SummarizerConfig) -> Self {
        Self {
            host,
            store,
            jobs: TaskRegistry::new("summarizer"),
            config,
        }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    pub async fn summary(&self, chat_id: &str) -> Option<ConversationSummary> {
        self.store.get(chat_id).await
    }

    pub fn is_running(&self, chat_id: &str) -> bool {
        self.jobs.is_running(chat_id)
    }

    /// Spawn a summary job for `chat_id` if one is due. Returns whether a
    /// job was started.
    pub fn maybe_summarize(&self, chat_id: &str, history: &[ChatMessage]) -> bool {
        if !self.config.should_trigger(history.len()) {
            debug!(chat_id, messages = history.len(), "summary not due");
            return false;
        }
        if self.host.probe().probe().low_memory {
            info!(chat_id, "device memory low; summary skipped");
            return false;
        }

        let input = self.input(history);
        if input.is_empty() {
            return false;
        }
        let covered = history.len();
        let host = Arc::clone(&self.host);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let id = chat_id.to_owned();

        let spawned = self.jobs.spawn(chat_id, move |_control| async move {
            match summarize(&host, store.as_ref(), &config, &id, &input, covered).await {
                Ok(summary) => info!(
                    chat_id = %id,
                    covered = summary.covered_message_count,
                    chars = summary.text.chars().count(),
                    "conversation summarized"
                ),
                Err(e) => warn!(chat_id = %id, error = %e, "summary failed"),
            }
        });
        spawned.is_some()
    }

    /// The older part of `history` as fed to the model.
    pub fn input(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let older_end = history.len().saturating_sub(self.config.keep_recent);
        let older: Vec<&ChatMessage> = history[..older_end]
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let start = older.len().saturating_sub(self.config.max_input_messages);
        older[start..]
            .iter()
            .map(|m| ChatMessage::new(m.role, clip(&m.content, self.config.per_message_chars)))
            .collect()
    }

    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }
}

async fn summarize(
    host: &ModelHost,
    store: &dyn SummaryStore,
    config: &SummarizerConfig,
    chat_id: &str,
    input: &[ChatMessage],
    covered: usize,
) -> Result<ConversationSummary, SummarizeError> {
    let session = host.session().await.ok_or(SummarizeError::NoModel)?;

    let transcript = input
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = [
        ChatMessage::system(format!(
            "{INSTRUCTION} Stay under {} characters.",
            config.max_summary_chars
        )),
        ChatMessage::user(transcript),
    ];
    let options = GenerateOptions {
        max_tokens: config.max_tokens,
        temperature: Some(config.temperature),
    };

    let generation = session
        .try_generate(
            &messages,
            options,
            Some(Duration::from_millis(config.deadline_ms)),
        )
        .await
        .map_err(|e| match e {
            SessionError::Busy => SummarizeError::Busy,
            other => SummarizeError::Session(other),
        })?;
    let text = clip(generation.text.trim(), config.max_summary_chars);
    let text = text.trim().to_owned();
    if text.is_empty() {
        return Err(SummarizeError::Empty);
    }

    let summary = ConversationSummary {
        chat_id: chat_id.to_owned(),
        text,
        covered_message_count: covered,
        created_at: Utc::now(),
    };
    store.put(summary.clone()).await?;
    Ok(summary)
}

/// First `max` characters of `text`.
fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}
