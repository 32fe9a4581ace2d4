use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use pocketlm_types::{ChatMessage, LoadedModelInfo};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{SessionConfig, SessionError};
use crate::device::MemoryProbe;
use crate::engine::{EngineError, EngineSession, GenerateOptions, StreamChunk, StreamHandle};
use crate::planner::{LoadConfig, LoadPlanner};
use crate::prompt::{ModelMetadata, PromptSource, Templater, drop_oldest_turn, keep_latest};

/// State shared between a session and the token stream it handed out.
struct Shared {
    model_id: String,
    engine: Mutex<Option<Arc<dyn EngineSession>>>,
    /// Bumped by every cancel and every new generation; a stream whose epoch
    /// is no longer current stops at its next token.
    epoch: watch::Sender<u64>,
    /// Epoch of the stream currently producing tokens, 0 when idle.
    running: AtomicU64,
}

impl Shared {
    fn engine(&self) -> Option<Arc<dyn EngineSession>> {
        self.lock_engine().clone()
    }

    fn take_engine(&self) -> Option<Arc<dyn EngineSession>> {
        self.lock_engine().take()
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn EngineSession>>> {
        self.engine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_generating(&self) -> bool {
        self.running.load(Ordering::SeqCst) != 0
    }

    /// Open a new epoch and mark it running.
    fn begin(&self) -> u64 {
        let mut next = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
            self.running.store(next, Ordering::SeqCst);
        });
        next
    }

    /// Retire the current epoch; any stream still holding it is stale.
    fn stop(&self) {
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            self.running.store(0, Ordering::SeqCst);
        });
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn release(&self, epoch: u64) {
        let _ = self
            .running
            .compare_exchange(epoch, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Drop the engine session after a native failure.
    fn poison(&self, message: &str) {
        if let Some(engine) = self.take_engine() {
            error!(model_id = %self.model_id, error = %message, "engine failure; session dropped, reload required");
            tokio::spawn(async move {
                if let Err(e) = engine.unload().await {
                    warn!(error = %e, "unloading a failed engine session also failed");
                }
            });
        }
    }
}

/// Result of [`InferenceSession::generate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Older turns were dropped to fit the prompt budget.
    pub truncated: bool,
    pub source: PromptSource,
}

/// Tokens of one generation, in order. Finite and not restartable.
pub struct GenerationStream {
    truncated: bool,
    source: PromptSource,
    inner: BoxStream<'static, Result<String, SessionError>>,
}

impl GenerationStream {
    /// Whether older turns were dropped to fit the prompt budget. Callers
    /// should surface this; the model did not see the full history.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn prompt_source(&self) -> PromptSource {
        self.source
    }
}

impl Stream for GenerationStream {
    type Item = Result<String, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("truncated", &self.truncated)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// One loaded model. At most one generation runs at a time; starting a new
/// one with [`InferenceSession::generate_stream`] cancels the previous,
/// [`InferenceSession::try_generate_stream`] refuses instead.
pub struct InferenceSession {
    info: LoadedModelInfo,
    model_bytes: u64,
    load_config: LoadConfig,
    metadata: ModelMetadata,
    shared: Arc<Shared>,
    start_lock: tokio::sync::Mutex<()>,
    probe: Arc<dyn MemoryProbe>,
    planner: LoadPlanner,
    templater: Templater,
    config: SessionConfig,
}

impl std::fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession")
            .field("info", &self.info)
            .field("load_config", &self.load_config)
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}

impl InferenceSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: LoadedModelInfo,
        model_bytes: u64,
        load_config: LoadConfig,
        metadata: ModelMetadata,
        engine: Arc<dyn EngineSession>,
        probe: Arc<dyn MemoryProbe>,
        planner: LoadPlanner,
        templater: Templater,
        config: SessionConfig,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                model_id: info.model_id.clone(),
                engine: Mutex::new(Some(engine)),
                epoch,
                running: AtomicU64::new(0),
            }),
            info,
            model_bytes,
            load_config,
            metadata,
            start_lock: tokio::sync::Mutex::new(()),
            probe,
            planner,
            templater,
            config,
        }
    }

    pub fn info(&self) -> &LoadedModelInfo {
        &self.info
    }

    pub fn load_config(&self) -> &LoadConfig {
        &self.load_config
    }

    /// `false` once the engine session was dropped after a failure or unload.
    pub fn is_loaded(&self) -> bool {
        self.shared.engine().is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.shared.is_generating()
    }

    /// Stop the running generation. The session is idle on return; a stream
    /// still held by the caller ends at its next poll.
    pub fn cancel(&self) {
        if self.shared.is_generating() {
            info!(model_id = %self.info.model_id, "generation cancel requested");
        }
        self.shared.stop();
        if let Some(engine) = self.shared.engine() {
            engine.cancel_generation();
        }
    }

    pub async fn unload(&self) {
        self.cancel();
        if let Some(engine) = self.shared.take_engine() {
            match engine.unload().await {
                Ok(()) => info!(model_id = %self.info.model_id, "model unloaded"),
                Err(e) => warn!(model_id = %self.info.model_id, error = %e, "model unload failed"),
            }
        }
    }

    /// Start generating a reply to `messages`, cancelling any generation
    /// already running.
    pub async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<GenerationStream, SessionError> {
        let _start = self.start_lock.lock().await;
        if self.shared.is_generating() {
            debug!(model_id = %self.info.model_id, "cancelling previous generation");
            self.cancel();
        }
        self.start(messages, options).await
    }

    /// Like [`InferenceSession::generate_stream`] but never interrupts
    /// another caller: returns [`SessionError::Busy`] while a generation is
    /// running or being started.
    pub async fn try_generate_stream(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<GenerationStream, SessionError> {
        let _start = self.start_lock.try_lock().map_err(|_| SessionError::Busy)?;
        if self.shared.is_generating() {
            return Err(SessionError::Busy);
        }
        self.start(messages, options).await
    }

    /// Collect a whole reply. `deadline` bounds total generation time; when
    /// it passes the generation is cancelled and the text so far returned.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
        deadline: Option<Duration>,
    ) -> Result<Generation, SessionError> {
        let stream = self.generate_stream(messages, options).await?;
        self.collect(stream, deadline).await
    }

    /// [`InferenceSession::generate`] on top of
    /// [`InferenceSession::try_generate_stream`].
    pub async fn try_generate(
        &self,
        messages: &[ChatMessage],
        options: GenerateOptions,
        deadline: Option<Duration>,
    ) -> Result<Generation, SessionError> {
        let stream = self.try_generate_stream(messages, options).await?;
        self.collect(stream, deadline).await
    }

    /// Caller holds `start_lock` and no generation is running.
    async fn start(
        &self,
        messages: &[ChatMessage],
        mut options: GenerateOptions,
    ) -> Result<GenerationStream, SessionError> {
        options.max_tokens = options.max_tokens.min(self.config.max_tokens);
        let engine = self.shared.engine().ok_or(SessionError::NotLoaded)?;

        let memory = self.probe.probe();
        self.planner.preflight(self.model_bytes, &memory)?;

        let budget = self.config.prompt_budget(self.load_config.batch_size);
        let with_system = self.templater.with_system(messages);
        let mut fit = keep_latest(&with_system, budget);
        let mut prompt = self
            .templater
            .format(&fit.messages, &self.metadata, Some(engine.as_ref()));
        // Markup is not part of the content estimate; drop further turns
        // until the rendered text fits.
        while prompt.text.chars().count() > budget {
            if !drop_oldest_turn(&mut fit) {
                fit.overflow = true;
                break;
            }
            prompt = self
                .templater
                .format(&fit.messages, &self.metadata, Some(engine.as_ref()));
        }
        if fit.truncated {
            warn!(
                model_id = %self.info.model_id,
                budget,
                kept = fit.messages.len(),
                dropped = with_system.len() - fit.messages.len(),
                overflow = fit.overflow,
                "conversation truncated to fit the prompt budget"
            );
        }
        debug!(model_id = %self.info.model_id, source = %prompt.source, chars = prompt.text.chars().count(), "prompt assembled");

        let epoch = self.shared.begin();
        let epoch_rx = self.shared.epoch.subscribe();

        let rx = match engine.generate_stream(&prompt.text, &options).await {
            Ok(rx) => rx,
            Err(e) => {
                self.shared.release(epoch);
                self.shared.poison(&e.to_string());
                return Err(e.into());
            }
        };

        let pump = Pump {
            rx,
            epoch_rx,
            epoch,
            engine,
            shared: Arc::clone(&self.shared),
            produced: 0,
            finished: false,
            prefill_timeout: self.config.prefill_timeout(),
            placeholder: self.config.empty_output_placeholder.clone(),
        };
        let inner = stream::unfold(pump, |mut pump| async move {
            let item = pump.next().await?;
            Some((item, pump))
        })
        .boxed();

        Ok(GenerationStream {
            truncated: fit.truncated,
            source: prompt.source,
            inner,
        })
    }

    async fn collect(
        &self,
        mut stream: GenerationStream,
        deadline: Option<Duration>,
    ) -> Result<Generation, SessionError> {
        let truncated = stream.truncated();
        let source = stream.prompt_source();
        let mut text = String::new();

        let collect = async {
            while let Some(token) = stream.next().await {
                text.push_str(&token?);
            }
            Ok::<_, SessionError>(())
        };

        match deadline {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(model_id = %self.info.model_id, limit_ms = limit.as_millis() as u64, "generation deadline reached");
                    self.cancel();
                }
            },
            None => collect.await?,
        }
        drop(stream);

        Ok(Generation {
            text,
            truncated,
            source,
        })
    }
}

enum Wake {
    Cancelled,
    Chunk(Option<StreamChunk>),
}

/// Drives one engine stream; dropped when the stream ends or is dropped.
struct Pump {
    rx: StreamHandle,
    epoch_rx: watch::Receiver<u64>,
    epoch: u64,
    engine: Arc<dyn EngineSession>,
    shared: Arc<Shared>,
    produced: usize,
    finished: bool,
    prefill_timeout: Duration,
    placeholder: String,
}

impl Pump {
    async fn next(&mut self) -> Option<Result<String, SessionError>> {
        if self.finished {
            return None;
        }
        loop {
            if self.shared.current_epoch() != self.epoch {
                return self.cancelled();
            }

            let rx = &mut self.rx;
            let epoch_rx = &mut self.epoch_rx;
            let wake = async {
                tokio::select! {
                    biased;
                    changed = epoch_rx.changed() => {
                        // The sender lives in `Shared`, which we hold; an error
                        // cannot happen but is treated as a cancel.
                        let _ = changed;
                        Wake::Cancelled
                    }
                    chunk = rx.recv() => Wake::Chunk(chunk),
                }
            };

            let wake = if self.produced == 0 {
                match tokio::time::timeout(self.prefill_timeout, wake).await {
                    Ok(wake) => wake,
                    Err(_) => {
                        self.engine.cancel_generation();
                        self.finish();
                        warn!(model_id = %self.shared.model_id, timeout_ms = self.prefill_timeout.as_millis() as u64, "prefill timed out");
                        return Some(Err(SessionError::PrefillTimeout {
                            timeout_ms: self.prefill_timeout.as_millis() as u64,
                        }));
                    }
                }
            } else {
                wake.await
            };

            match wake {
                Wake::Cancelled => continue,
                Wake::Chunk(_) if self.shared.current_epoch() != self.epoch => {
                    return self.cancelled();
                }
                Wake::Chunk(Some(StreamChunk::Token(token))) => {
                    if token.is_empty() {
                        continue;
                    }
                    self.produced += 1;
                    return Some(Ok(token));
                }
                Wake::Chunk(Some(StreamChunk::Done) | None) => {
                    self.finish();
                    if self.produced == 0 {
                        warn!(model_id = %self.shared.model_id, "engine produced no tokens; emitting placeholder");
                        self.produced = 1;
                        return Some(Ok(self.placeholder.clone()));
                    }
                    debug!(model_id = %self.shared.model_id, tokens = self.produced, "generation finished");
                    return None;
                }
                Wake::Chunk(Some(StreamChunk::Error(message))) => {
                    self.finish();
                    self.shared.poison(&message);
                    return Some(Err(SessionError::Engine(EngineError::Corrupted { message })));
                }
            }
        }
    }

    fn cancelled(&mut self) -> Option<Result<String, SessionError>> {
        self.finish();
        debug!(model_id = %self.shared.model_id, tokens = self.produced, "generation cancelled");
        (self.produced == 0).then_some(Err(SessionError::Cancelled))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.shared.release(self.epoch);
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        // A stale pump must not cancel the generation that replaced it.
        if !self.finished && self.shared.current_epoch() == self.epoch {
            self.engine.cancel_generation();
        }
        self.shared.release(self.epoch);
    }
}
