//! The process-scoped history core.
//!
//! Built once at startup, passed explicitly to every operation, torn down in
//! reverse construction order.

use anyhow::Context as _;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::info;

use crate::clipboard::{ArboardClipboard, ClipboardSource, ClipboardWatcher, WatcherOptions, WatcherTask};
use crate::config::Config;
use crate::database::ClipStore;
use crate::error::StoreError;
use crate::events::ChangeNotifier;
use crate::ocr::{OcrCoordinator, OcrEngine, TesseractEngine};
use crate::query::QueryService;
use crate::retention::{RetentionManager, RetentionTask};
use crate::settings::{SettingsStore, CAPTURE_IMAGES};

#[derive(Default)]
struct BackgroundTasks {
    watcher: Option<WatcherTask>,
    retention: Option<RetentionTask>,
}

pub struct HistoryCore {
    config: Config,
    settings: Arc<SettingsStore>,
    store: Arc<ClipStore>,
    notifier: Arc<ChangeNotifier>,
    queries: QueryService,
    watcher: Arc<ClipboardWatcher>,
    retention: RetentionManager,
    ocr: OcrCoordinator,
    tasks: Mutex<BackgroundTasks>,
}

impl HistoryCore {
    /// Open every component without starting background work.
    pub fn open(
        config: Config,
        clipboard: Box<dyn ClipboardSource>,
        engine: Arc<dyn OcrEngine>,
        runtime: Handle,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(ClipStore::open(&config.db_path(), &config.images_dir())?);
        let settings = Arc::new(SettingsStore::open(&store)?);
        let notifier = Arc::new(ChangeNotifier::new());
        let queries = QueryService::new(store.clone());

        let capture_images = if settings.is_set(CAPTURE_IMAGES) {
            settings.capture_images()
        } else {
            config.capture_images
        };
        let watcher = Arc::new(ClipboardWatcher::new(
            store.clone(),
            notifier.clone(),
            clipboard,
            WatcherOptions {
                capture_images,
                max_text_len: config.max_text_len,
            },
        ));

        let retention = RetentionManager::new(store.clone(), settings.clone(), notifier.clone());
        let ocr = OcrCoordinator::new(
            store.clone(),
            notifier.clone(),
            engine,
            config.ocr_languages.clone(),
            config.ocr_max_concurrent,
            runtime,
        );

        info!(data_dir = %config.data_dir.display(), capture_images, "History core opened");
        Ok(Self {
            config,
            settings,
            store,
            notifier,
            queries,
            watcher,
            retention,
            ocr,
            tasks: Mutex::new(BackgroundTasks::default()),
        })
    }

    /// Open with the OS clipboard and tesseract, then start background work.
    pub fn launch(config: Config, runtime: Handle) -> anyhow::Result<Self> {
        let engine = Arc::new(TesseractEngine::new(config.ocr_command.clone()));
        let core = Self::open(config, Box::new(ArboardClipboard), engine, runtime)
            .context("failed to open clip history")?;
        core.start().context("failed to start background threads")?;
        Ok(core)
    }

    /// Spawn the watcher and the retention thread. Calling it twice is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.watcher.is_none() {
            tasks.watcher = Some(self.watcher.start(self.config.poll_interval())?);
        }
        if tasks.retention.is_none() {
            tasks.retention = Some(self.retention.start(self.config.sweep_interval())?);
        }
        Ok(())
    }

    /// Stop in reverse order: OCR admissions, retention, then the watcher.
    pub fn shutdown(&self) {
        self.ocr.shutdown();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let was_running = tasks.retention.is_some() || tasks.watcher.is_some();
        if let Some(mut retention) = tasks.retention.take() {
            retention.stop();
        }
        if let Some(mut watcher) = tasks.watcher.take() {
            watcher.stop();
        }
        if was_running {
            info!("History core shut down");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn store(&self) -> &ClipStore {
        &self.store
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub fn watcher(&self) -> &ClipboardWatcher {
        &self.watcher
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn ocr(&self) -> &OcrCoordinator {
        &self.ocr
    }
}

impl Drop for HistoryCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clipboard::testing::FakeClipboard;
    use crate::ocr::testing::StaticEngine;
    use std::sync::OnceLock;
    use tokio::runtime::Runtime;

    pub fn runtime() -> Handle {
        static RUNTIME: OnceLock<Runtime> = OnceLock::new();
        RUNTIME
            .get_or_init(|| Runtime::new().expect("test runtime"))
            .handle()
            .clone()
    }

    /// A core over a temp dir, a fake clipboard and a canned OCR engine.
    pub fn open_core() -> (tempfile::TempDir, HistoryCore) {
        let dir = tempfile::tempdir().unwrap();
        let core = HistoryCore::open(
            Config::with_data_dir(dir.path()),
            Box::new(FakeClipboard::default()),
            Arc::new(StaticEngine("recognized".to_string())),
            runtime(),
        )
        .unwrap();
        (dir, core)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::open_core;
    use crate::models::NewClip;
    use crate::settings::{CAPTURE_IMAGES, RETENTION_DAYS};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    #[test]
    fn start_runs_first_sweep_and_shutdown_is_idempotent() {
        let (_dir, core) = open_core();
        core.settings().set_setting(RETENTION_DAYS, "7").unwrap();
        let old = core
            .store()
            .insert(NewClip::text("stale").at(Utc::now() - ChronoDuration::days(8)))
            .unwrap();
        let sub = core.notifier().subscribe();

        core.start().unwrap();
        core.start().unwrap();
        assert!(sub.recv_timeout(Duration::from_secs(5)));
        assert!(core.store().get(&old.id).unwrap_err().is_not_found());

        core.shutdown();
        core.shutdown();
    }

    #[test]
    fn stored_capture_setting_wins_over_config() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = crate::config::Config::with_data_dir(dir.path());
            let store = crate::database::ClipStore::open(&config.db_path(), &config.images_dir()).unwrap();
            let settings = crate::settings::SettingsStore::open(&store).unwrap();
            settings.set_setting(CAPTURE_IMAGES, "true").unwrap();
        }

        let core = super::HistoryCore::open(
            crate::config::Config::with_data_dir(dir.path()),
            Box::new(crate::clipboard::testing::FakeClipboard::default()),
            std::sync::Arc::new(crate::ocr::testing::StaticEngine(String::new())),
            super::testing::runtime(),
        )
        .unwrap();
        assert!(core.watcher().capture_images());
    }
}
