//! Retention sweeps: age-based eviction of non-favorite clips, an optional
//! record cap, and reconciliation of the image directory.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::ClipStore;
use crate::error::StoreError;
use crate::events::ChangeNotifier;
use crate::models::SweepReport;
use crate::settings::SettingsStore;

const CHECKPOINT_EVERY: u32 = 10;

#[derive(Clone)]
pub struct RetentionManager {
    store: Arc<ClipStore>,
    settings: Arc<SettingsStore>,
    notifier: Arc<ChangeNotifier>,
}

impl RetentionManager {
    pub fn new(store: Arc<ClipStore>, settings: Arc<SettingsStore>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            store,
            settings,
            notifier,
        }
    }

    /// One full sweep. Settings are read fresh every time.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        let retention_days = self.settings.retention_days();
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);

        let mut report = SweepReport {
            expired: self.store.delete_expired(cutoff)?,
            ..SweepReport::default()
        };

        if let Some(max_records) = self.settings.max_records() {
            report.trimmed = self.store.trim_to(max_records)?;
        }

        let (orphaned_files, dangling_records) = self.store.reconcile_images()?;
        report.orphaned_files = orphaned_files;
        report.dangling_records = dangling_records;

        if report.changed_records() {
            info!(
                retention_days,
                expired = report.expired,
                trimmed = report.trimmed,
                orphaned_files = report.orphaned_files,
                dangling_records = report.dangling_records,
                "Retention sweep removed clips"
            );
            self.notifier.notify();
        } else {
            debug!(retention_days, orphaned_files = report.orphaned_files, "Retention sweep found nothing to remove");
        }
        Ok(report)
    }

    /// Sweep now, then every `interval` until the returned handle is stopped.
    pub fn start(&self, interval: Duration) -> std::io::Result<RetentionTask> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let manager = self.clone();

        let handle = thread::Builder::new()
            .name("klip-retention".to_string())
            .spawn(move || {
                let mut cycles: u32 = 0;
                loop {
                    if let Err(e) = manager.sweep() {
                        warn!(error = %e, "Retention sweep failed");
                    }

                    cycles = cycles.wrapping_add(1);
                    if cycles % CHECKPOINT_EVERY == 0 {
                        if let Err(e) = manager.store.checkpoint() {
                            warn!(error = %e, "WAL checkpoint failed");
                        }
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Retention thread stopped");
            })?;

        Ok(RetentionTask {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

/// Handle to the periodic sweep thread. Dropping it stops the thread.
pub struct RetentionTask {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionTask {
    pub fn stop(&mut self) {
        // Dropping the sender wakes the thread out of its wait.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Retention thread panicked");
            }
        }
    }
}

impl Drop for RetentionTask {
    fn drop(&mut self) {
        self.stop();
    }
}
