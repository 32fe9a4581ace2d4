use std::collections::HashMap;
use std::sync::Arc;

use pocketlm_types::{DownloadEvent, DownloadState, DownloadStatus};
use tokio::sync::{RwLock, broadcast};

const CHANNEL_CAPACITY: usize = 256;

/// Observable download state for every known model.
///
/// Readers clone the store freely; only the download manager (inside this
/// crate) writes to it. Every write is also broadcast, so observers can
/// either poll [`DownloadStore::get`] or follow [`DownloadStore::subscribe`].
#[derive(Debug, Clone)]
pub struct DownloadStore {
    inner: Arc<RwLock<HashMap<String, DownloadState>>>,
    updates: broadcast::Sender<DownloadState>,
    events: broadcast::Sender<DownloadEvent>,
}

impl Default for DownloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            updates,
            events,
        }
    }

    /// State for `model_id`; unknown ids read as `NotDownloaded`.
    pub async fn get(&self, model_id: &str) -> DownloadState {
        self.inner
            .read()
            .await
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| DownloadState::not_downloaded(model_id))
    }

    /// Snapshot of every tracked model, sorted by id.
    pub async fn snapshot(&self) -> Vec<DownloadState> {
        let mut all: Vec<_> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }

    /// Every state change, for all models.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadState> {
        self.updates.subscribe()
    }

    /// Progress / completion / failure notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    // ── writer side ──────────────────────────────────────────────────────

    pub(crate) async fn update<F>(&self, model_id: &str, f: F) -> DownloadState
    where
        F: FnOnce(&mut DownloadState),
    {
        let snapshot = {
            let mut guard = self.inner.write().await;
            let state = guard
                .entry(model_id.to_owned())
                .or_insert_with(|| DownloadState::not_downloaded(model_id));
            f(state);
            normalize(state);
            state.clone()
        };
        // No receivers is fine.
        let _ = self.updates.send(snapshot.clone());
        snapshot
    }

    pub(crate) async fn replace(&self, state: DownloadState) {
        let mut state = state;
        normalize(&mut state);
        self.inner
            .write()
            .await
            .insert(state.model_id.clone(), state.clone());
        let _ = self.updates.send(state);
    }

    pub(crate) async fn reset(&self, model_id: &str) {
        self.replace(DownloadState::not_downloaded(model_id)).await;
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }
}

fn normalize(state: &mut DownloadState) {
    // A server may send a byte more than it announced.
    if let Some(total) = state.total_bytes {
        if state.downloaded_bytes > total {
            state.total_bytes = Some(state.downloaded_bytes);
        }
    }
    if state.status != DownloadStatus::Downloaded {
        state.local_path = None;
    }
    if state.status != DownloadStatus::Error {
        state.error_message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn unknown_model_reads_not_downloaded() {
        let store = DownloadStore::new();
        let state = store.get("nope").await;
        assert_eq!(state.status, DownloadStatus::NotDownloaded);
        assert_eq!(state.downloaded_bytes, 0);
    }

    #[tokio::test]
    async fn updates_are_broadcast_and_normalized() {
        let store = DownloadStore::new();
        let mut rx = store.subscribe();

        store
            .update("m", |s| {
                s.status = DownloadStatus::Downloading;
                s.downloaded_bytes = 11;
                s.total_bytes = Some(10);
                s.local_path = Some(PathBuf::from("/x"));
            })
            .await;

        let seen = rx.recv().await.expect("broadcast");
        assert_eq!(seen.total_bytes, Some(11));
        assert!(seen.local_path.is_none());
        assert_eq!(store.get("m").await, seen);
    }
}
