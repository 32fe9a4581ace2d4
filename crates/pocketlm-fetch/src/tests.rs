#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use pocketlm_types::{DownloadEvent, DownloadState, DownloadStatus, ModelDescriptor};
    use sha2::{Digest, Sha256};
    use tracing_test::traced_test;

    use crate::error::FetchError;
    use crate::layout::ModelLayout;
    use crate::manager::{DownloadConfig, DownloadManager, sha256_file};
    use crate::transport::{TransferResponse, Transport};

    /// Serves `data` from memory, honouring `Range` offsets unless told not to.
    struct MemoryTransport {
        data: Bytes,
        chunk_size: usize,
        honour_range: bool,
        /// On the first open only, stop yielding after this many bytes and
        /// hang until the job is signalled.
        stall_first_after: Option<usize>,
        /// Overrides the announced body length.
        announced_len: Option<u64>,
        /// Every open fails with a retryable error.
        unreachable: bool,
        opens: Mutex<Vec<u64>>,
    }

    impl MemoryTransport {
        fn new(data: impl Into<Bytes>) -> Self {
            Self {
                data: data.into(),
                chunk_size: 16,
                honour_range: true,
                stall_first_after: None,
                announced_len: None,
                unreachable: false,
                opens: Mutex::new(Vec::new()),
            }
        }

        fn opens(&self) -> Vec<u64> {
            self.opens.lock().expect("opens lock").clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self, _url: &str, offset: u64) -> Result<TransferResponse, FetchError> {
            let first = {
                let mut opens = self.opens.lock().expect("opens lock");
                opens.push(offset);
                opens.len() == 1
            };
            if self.unreachable {
                return Err(FetchError::Interrupted {
                    message: "connection reset".to_owned(),
                });
            }

            let partial = self.honour_range && offset > 0;
            let start = if partial { offset as usize } else { 0 };
            let rest = self.data.slice(start.min(self.data.len())..);
            let content_length = Some(self.announced_len.unwrap_or(rest.len() as u64));

            let chunks: Vec<Result<Bytes, FetchError>> = rest
                .chunks(self.chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let body = futures::stream::iter(chunks);
            let body = match self.stall_first_after.filter(|_| first) {
                Some(bytes) => body
                    .take(bytes / self.chunk_size)
                    .chain(futures::stream::pending())
                    .boxed(),
                None => body.boxed(),
            };

            Ok(TransferResponse {
                partial,
                content_length,
                body,
            })
        }
    }

    fn test_config() -> DownloadConfig {
        DownloadConfig {
            retry_count: 1,
            retry_delay: Duration::from_millis(10),
            progress_interval: Duration::ZERO,
            size_tolerance: 1,
            stop_wait: Duration::from_secs(2),
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn descriptor(id: &str, len: usize) -> ModelDescriptor {
        ModelDescriptor::new(id, format!("https://models.test/{id}.gguf"), len as u64)
    }

    fn manager_for(dir: &Path, transport: Arc<MemoryTransport>) -> DownloadManager {
        DownloadManager::with_config(ModelLayout::new(dir), transport, test_config())
    }

    async fn wait_for<F>(manager: &DownloadManager, model_id: &str, pred: F) -> DownloadState
    where
        F: Fn(&DownloadState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = manager.state(model_id).await;
                if pred(&state) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state condition should be reached")
    }

    async fn wait_idle(manager: &DownloadManager, model_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.active_jobs(model_id) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job should exit");
    }

    // ── transfer ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn download_completes_and_renames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = payload(1000);
        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let manager = manager_for(dir.path(), transport);
        let mut events = manager.subscribe_events();

        assert!(manager.start(&descriptor("m", 1000)).await.expect("start"));
        let state = wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;

        let final_path = manager.layout().final_path("m");
        assert_eq!(state.local_path.as_deref(), Some(final_path.as_path()));
        assert_eq!(state.downloaded_bytes, 1000);
        assert!(!manager.layout().temp_path("m").exists());
        assert_eq!(std::fs::read(&final_path).expect("read model"), data);
        assert!(manager.is_downloaded("m"));

        wait_idle(&manager, "m").await;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Completed { model_id } = event {
                assert_eq!(model_id, "m");
                completed = true;
            }
        }
        assert!(completed, "completion event should be emitted");
    }

    #[tokio::test]
    async fn pause_then_resume_matches_uninterrupted_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = payload(4096);
        let mut transport = MemoryTransport::new(data.clone());
        transport.stall_first_after = Some(1600);
        let transport = Arc::new(transport);
        let manager = manager_for(dir.path(), Arc::clone(&transport));
        let model = descriptor("m", data.len());

        manager.start(&model).await.expect("start");
        wait_for(&manager, "m", |s| s.downloaded_bytes == 1600).await;

        assert!(manager.pause("m"));
        let paused = wait_for(&manager, "m", |s| s.status == DownloadStatus::Paused).await;
        assert_eq!(paused.downloaded_bytes, 1600);
        wait_idle(&manager, "m").await;
        let temp_len = std::fs::metadata(manager.layout().temp_path("m"))
            .expect("temp kept")
            .len();
        assert_eq!(temp_len, 1600);

        assert!(manager.resume(&model).await.expect("resume"));
        wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;

        assert_eq!(transport.opens(), vec![0, 1600]);
        let on_disk = sha256_file(&manager.layout().final_path("m"))
            .await
            .expect("hash");
        let expected: String = Sha256::digest(&data)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(on_disk, expected);
    }

    #[tokio::test]
    async fn resumed_total_adds_partial_length_to_remaining_body() {
        const PARTIAL: u64 = 500_000_000;
        const REMAINING: u64 = 700_000_000;

        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ModelLayout::new(dir.path());
        // Sparse file: no 500 MB write needed.
        std::fs::File::create(layout.temp_path("big"))
            .and_then(|f| f.set_len(PARTIAL))
            .expect("sparse temp file");

        let mut transport = MemoryTransport::new(Vec::<u8>::new());
        transport.announced_len = Some(REMAINING);
        transport.stall_first_after = Some(0);
        let manager = manager_for(dir.path(), Arc::new(transport));

        manager
            .start(&descriptor("big", 0))
            .await
            .expect("start");
        let state = wait_for(&manager, "big", |s| s.total_bytes.is_some()).await;
        assert_eq!(state.total_bytes, Some(1_200_000_000));
        assert_eq!(state.downloaded_bytes, PARTIAL);

        manager.cancel("big", false).await.expect("cancel");
        assert!(layout.temp_path("big").exists(), "partial kept when not deleting");
    }

    #[tokio::test]
    async fn resumed_file_is_partial_plus_remaining() {
        const PARTIAL: usize = 400;
        const REMAINING: usize = 600;

        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ModelLayout::new(dir.path());
        let data = payload(PARTIAL + REMAINING);
        std::fs::write(layout.temp_path("m"), &data[..PARTIAL]).expect("seed temp");

        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let manager = manager_for(dir.path(), Arc::clone(&transport));

        manager.start(&descriptor("m", 0)).await.expect("start");
        let state = wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;

        assert_eq!(transport.opens(), vec![PARTIAL as u64]);
        assert_eq!(state.total_bytes, Some((PARTIAL + REMAINING) as u64));
        let on_disk = std::fs::read(layout.final_path("m")).expect("final file");
        assert_eq!(on_disk.len(), PARTIAL + REMAINING);
        assert_eq!(on_disk, data);
        assert!(!layout.temp_path("m").exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn server_ignoring_range_restarts_from_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ModelLayout::new(dir.path());
        std::fs::write(layout.temp_path("m"), b"stale-prefix").expect("seed temp");

        let data = payload(300);
        let mut transport = MemoryTransport::new(data.clone());
        transport.honour_range = false;
        let manager = manager_for(dir.path(), Arc::new(transport));

        manager.start(&descriptor("m", 300)).await.expect("start");
        wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;

        assert_eq!(std::fs::read(layout.final_path("m")).expect("read"), data);
        assert!(logs_contain("download started"));
    }

    #[tokio::test]
    async fn short_body_is_an_error_and_keeps_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = MemoryTransport::new(payload(100));
        transport.announced_len = Some(200);
        let manager = manager_for(dir.path(), Arc::new(transport));
        let mut events = manager.subscribe_events();

        manager.start(&descriptor("m", 200)).await.expect("start");
        let state = wait_for(&manager, "m", |s| s.status == DownloadStatus::Error).await;

        assert!(state.error_message.as_deref().unwrap_or_default().contains("incomplete"));
        assert!(!manager.is_downloaded("m"));
        let temp_len = std::fs::metadata(manager.layout().temp_path("m"))
            .expect("partial kept")
            .len();
        assert_eq!(temp_len, 100);

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(DownloadEvent::Failed { model_id, .. }) = events.recv().await {
                    return model_id;
                }
            }
        })
        .await
        .expect("failure event");
        assert_eq!(failed, "m");
    }

    #[tokio::test]
    async fn one_extra_byte_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = MemoryTransport::new(payload(101));
        transport.announced_len = Some(100);
        let manager = manager_for(dir.path(), Arc::new(transport));

        manager.start(&descriptor("m", 100)).await.expect("start");
        let state = wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;
        assert_eq!(state.downloaded_bytes, 101);
        assert_eq!(state.total_bytes, Some(101));
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(dir.path(), Arc::new(MemoryTransport::new(payload(64))));
        let model = descriptor("m", 64).with_sha256("00".repeat(32));

        manager.start(&model).await.expect("start");
        let state = wait_for(&manager, "m", |s| s.status == DownloadStatus::Error).await;

        assert!(state.error_message.as_deref().unwrap_or_default().contains("checksum"));
        assert!(!manager.layout().temp_path("m").exists());
        assert!(!manager.layout().final_path("m").exists());
    }

    #[tokio::test]
    async fn matching_checksum_is_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = payload(64);
        let digest: String = Sha256::digest(&data)
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        let manager = manager_for(dir.path(), Arc::new(MemoryTransport::new(data)));

        manager
            .start(&descriptor("m", 64).with_sha256(digest))
            .await
            .expect("start");
        wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;
    }

    // ── job supervision ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_start_for_inflight_model_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = MemoryTransport::new(payload(256));
        transport.stall_first_after = Some(0);
        let transport = Arc::new(transport);
        let manager = manager_for(dir.path(), Arc::clone(&transport));
        let model = descriptor("m", 256);

        assert!(manager.start(&model).await.expect("first start"));
        assert!(!manager.start(&model).await.expect("second start"));
        assert_eq!(manager.active_jobs("m"), 1);

        manager.cancel("m", true).await.expect("cancel");
        assert_eq!(manager.active_jobs("m"), 0);
        assert_eq!(transport.opens().len(), 1);
        assert_eq!(manager.state("m").await.status, DownloadStatus::NotDownloaded);
        assert!(!manager.layout().temp_path("m").exists());
    }

    #[tokio::test]
    async fn racing_starts_spawn_one_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = payload(64);
        let transport = Arc::new(MemoryTransport::new(data.clone()));
        let manager = manager_for(dir.path(), Arc::clone(&transport));
        let model = descriptor("m", 64);

        let (a, b) = tokio::join!(manager.start(&model), manager.start(&model));
        let started = [a.expect("start a"), b.expect("start b")];
        assert_eq!(started.iter().filter(|s| **s).count(), 1);

        wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;
        wait_idle(&manager, "m").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = manager.state("m").await;
        assert_eq!(state.status, DownloadStatus::Downloaded);
        assert_eq!(state.downloaded_bytes, 64);
        assert_eq!(transport.opens().len(), 1);
        assert_eq!(std::fs::read(manager.layout().final_path("m")).expect("final"), data);
    }

    #[tokio::test]
    async fn pause_interrupts_retry_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = MemoryTransport::new(payload(64));
        transport.unreachable = true;
        let transport = Arc::new(transport);
        let manager = DownloadManager::with_config(
            ModelLayout::new(dir.path()),
            Arc::clone(&transport) as Arc<dyn Transport>,
            DownloadConfig {
                retry_count: 5,
                retry_delay: Duration::from_secs(30),
                ..test_config()
            },
        );

        manager.start(&descriptor("m", 64)).await.expect("start");
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.opens().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first attempt");

        assert!(manager.pause("m"));
        let state = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for(&manager, "m", |s| s.status == DownloadStatus::Paused),
        )
        .await
        .expect("pause should not wait out the retry delay");
        assert_eq!(state.downloaded_bytes, 0);
        wait_idle(&manager, "m").await;
        assert_eq!(transport.opens().len(), 1);
    }

    #[tokio::test]
    async fn start_of_downloaded_model_does_not_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ModelLayout::new(dir.path());
        std::fs::write(layout.final_path("m"), b"weights").expect("seed model");
        let transport = Arc::new(MemoryTransport::new(payload(8)));
        let manager = manager_for(dir.path(), Arc::clone(&transport));

        assert!(!manager.start(&descriptor("m", 8)).await.expect("start"));
        assert!(transport.opens().is_empty());
        assert_eq!(manager.state("m").await.status, DownloadStatus::Downloaded);
    }

    #[tokio::test]
    async fn delete_removes_final_and_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(dir.path(), Arc::new(MemoryTransport::new(payload(128))));

        manager.start(&descriptor("m", 128)).await.expect("start");
        wait_for(&manager, "m", |s| s.status == DownloadStatus::Downloaded).await;
        std::fs::write(manager.layout().temp_path("m"), b"leftover").expect("seed temp");

        manager.delete("m").await.expect("delete");

        assert!(!manager.layout().final_path("m").exists());
        assert!(!manager.layout().temp_path("m").exists());
        assert!(!manager.is_downloaded("m"));
        assert!(manager.path("m").is_none());
        assert_eq!(manager.state("m").await.status, DownloadStatus::NotDownloaded);
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_for(dir.path(), Arc::new(MemoryTransport::new(payload(8))));
        let err = manager
            .start(&descriptor("../escape", 8))
            .await
            .expect_err("must reject");
        assert!(matches!(err, FetchError::InvalidModelId(_)));
    }

    // ── startup scan ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reconcile_maps_files_to_states() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ModelLayout::new(dir.path());
        std::fs::write(layout.final_path("done"), vec![0u8; 10]).expect("final");
        std::fs::write(layout.temp_path("half"), vec![0u8; 4]).expect("temp");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("other");
        let manager = manager_for(dir.path(), Arc::new(MemoryTransport::new(payload(8))));

        let states = manager.reconcile().await.expect("reconcile");
        assert_eq!(states.len(), 2);

        let done = manager.state("done").await;
        assert_eq!(done.status, DownloadStatus::Downloaded);
        assert_eq!(done.downloaded_bytes, 10);

        let half = manager.state("half").await;
        assert_eq!(half.status, DownloadStatus::Paused);
        assert_eq!(half.downloaded_bytes, 4);
        assert_eq!(half.total_bytes, None);

        std::fs::remove_file(layout.final_path("done")).expect("remove");
        manager.reconcile().await.expect("reconcile again");
        assert_eq!(manager.state("done").await.status, DownloadStatus::NotDownloaded);
    }
}
