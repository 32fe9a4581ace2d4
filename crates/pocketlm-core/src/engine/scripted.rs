//! Deterministic engine for tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    EngineError, EngineSession, GenerateOptions, InferenceEngine, StreamChunk, StreamHandle,
};
use crate::planner::LoadConfig;

#[derive(Debug, Clone)]
pub enum End {
    Done,
    Error(String),
    /// Keep the channel open without sending anything until cancelled.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub tokens: Vec<String>,
    pub first_delay: Duration,
    pub token_delay: Duration,
    pub end: End,
}

impl Script {
    pub fn tokens(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            first_delay: Duration::ZERO,
            token_delay: Duration::from_millis(1),
            end: End::Done,
        }
    }

    pub fn with_delays(mut self, first: Duration, per_token: Duration) -> Self {
        self.first_delay = first;
        self.token_delay = per_token;
        self
    }

    pub fn ending(mut self, end: End) -> Self {
        self.end = end;
        self
    }
}

#[derive(Clone)]
pub struct ScriptedEngine {
    pub script: Arc<Mutex<Script>>,
    pub loads: Arc<AtomicUsize>,
    pub unloads: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub chat_template: Option<String>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            loads: Arc::new(AtomicUsize::new(0)),
            unloads: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            chat_template: None,
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(
        &self,
        _path: &Path,
        _config: &LoadConfig,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            engine: self.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct ScriptedSession {
    engine: ScriptedEngine,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl EngineSession for ScriptedSession {
    async fn generate_stream(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<StreamHandle, EngineError> {
        self.engine.prompts.lock().unwrap().push(prompt.to_owned());
        self.cancelled.store(false, Ordering::SeqCst);
        let script = self.engine.script.lock().unwrap().clone();
        let cancelled = Arc::clone(&self.cancelled);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            tokio::time::sleep(script.first_delay).await;
            for token in script.tokens {
                if cancelled.load(Ordering::SeqCst) {
                    let _ = tx.send(StreamChunk::Done).await;
                    return;
                }
                if tx.send(StreamChunk::Token(token)).await.is_err() {
                    return;
                }
                tokio::time::sleep(script.token_delay).await;
            }
            match script.end {
                End::Done => {
                    let _ = tx.send(StreamChunk::Done).await;
                }
                End::Error(message) => {
                    let _ = tx.send(StreamChunk::Error(message)).await;
                }
                End::Hang => {
                    while !cancelled.load(Ordering::SeqCst) && !tx.is_closed() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
        });
        Ok(rx)
    }

    fn cancel_generation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn chat_template(&self) -> Option<String> {
        self.engine.chat_template.clone()
    }

    async fn unload(&self) -> Result<(), EngineError> {
        self.engine.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
