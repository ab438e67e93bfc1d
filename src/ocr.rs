//! OCR backfill for image clips.
//!
//! Jobs are keyed by clip id. A job runs recognition on the blocking pool,
//! writes the trimmed text back through the clip store and signals the
//! notifier; its outcome goes only to the [`OcrJob`] handed to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::database::ClipStore;
use crate::error::{OcrError, StoreError};
use crate::events::ChangeNotifier;

/// A text recognition backend. Called on a blocking thread.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &Path, languages: &[String]) -> Result<String, OcrError>;
}

/// Runs the `tesseract` command line tool and reads the text from stdout.
pub struct TesseractEngine {
    command: String,
}

impl TesseractEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, image: &Path, languages: &[String]) -> Result<String, OcrError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(image).arg("stdout");
        if !languages.is_empty() {
            cmd.arg("-l").arg(languages.join("+"));
        }

        let output = cmd
            .output()
            .map_err(|e| OcrError::Engine(format!("failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

type Registry = Arc<Mutex<HashSet<String>>>;

/// Holds a clip id in the in-flight registry until dropped.
struct InFlight {
    registry: Registry,
    clip_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.clip_id);
    }
}

/// Pending OCR result for one clip.
pub struct OcrJob {
    clip_id: String,
    rx: oneshot::Receiver<Result<String, OcrError>>,
}

impl OcrJob {
    pub fn clip_id(&self) -> &str {
        &self.clip_id
    }

    /// The extracted text, or why there is none.
    pub async fn wait(self) -> Result<String, OcrError> {
        self.rx.await.unwrap_or(Err(OcrError::Abandoned))
    }

    /// Like [`OcrJob::wait`], for callers outside the async runtime.
    pub fn wait_blocking(self) -> Result<String, OcrError> {
        self.rx.blocking_recv().unwrap_or(Err(OcrError::Abandoned))
    }
}

pub struct OcrCoordinator {
    store: Arc<ClipStore>,
    notifier: Arc<ChangeNotifier>,
    engine: Arc<dyn OcrEngine>,
    languages: Arc<Vec<String>>,
    permits: Arc<Semaphore>,
    in_flight: Registry,
    runtime: Handle,
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

impl OcrCoordinator {
    pub fn new(
        store: Arc<ClipStore>,
        notifier: Arc<ChangeNotifier>,
        engine: Arc<dyn OcrEngine>,
        languages: Vec<String>,
        max_concurrent: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            notifier,
            engine,
            languages: Arc::new(languages),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            runtime,
        }
    }

    pub fn is_pending(&self, clip_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(clip_id)
    }

    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn register(&self, clip_id: &str) -> Result<InFlight, OcrError> {
        let mut registry = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !registry.insert(clip_id.to_string()) {
            return Err(OcrError::AlreadyPending(clip_id.to_string()));
        }
        Ok(InFlight {
            registry: self.in_flight.clone(),
            clip_id: clip_id.to_string(),
        })
    }

    /// Start extracting text for an image clip. `image_path` must be the
    /// clip's stored path. Rejects a second submission while one is pending.
    pub fn submit(&self, clip_id: &str, image_path: &Path) -> Result<OcrJob, OcrError> {
        let clip = self.store.get(clip_id).map_err(|e| match e {
            StoreError::NotFound(id) => OcrError::NotFound(id),
            other => OcrError::Store(other),
        })?;

        let stored_path = clip
            .image_path()
            .ok_or_else(|| OcrError::NotAnImage(clip_id.to_string()))?;
        if !same_file(stored_path, image_path) {
            return Err(OcrError::PathMismatch {
                id: clip_id.to_string(),
                given: image_path.display().to_string(),
            });
        }

        let guard = self.register(clip_id)?;
        let (tx, rx) = oneshot::channel();

        let job = JobContext {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            engine: self.engine.clone(),
            languages: self.languages.clone(),
            permits: self.permits.clone(),
            clip_id: clip_id.to_string(),
            path: stored_path.to_path_buf(),
        };

        debug!(clip_id = %clip_id, "OCR job submitted");
        self.runtime.spawn(async move {
            let _guard = guard;
            let clip_id = job.clip_id.clone();
            let result = job.run().await;
            match &result {
                Ok(text) => info!(clip_id = %clip_id, chars = text.chars().count(), "OCR backfill complete"),
                Err(e) => warn!(clip_id = %clip_id, error = %e, "OCR job failed"),
            }
            // The requester may have stopped listening.
            let _ = tx.send(result);
        });

        Ok(OcrJob {
            clip_id: clip_id.to_string(),
            rx,
        })
    }

    /// Stop admitting queued jobs. Jobs already recognizing run to the end.
    pub fn shutdown(&self) {
        self.permits.close();
        debug!(pending = self.pending_count(), "OCR coordinator shut down");
    }
}

struct JobContext {
    store: Arc<ClipStore>,
    notifier: Arc<ChangeNotifier>,
    engine: Arc<dyn OcrEngine>,
    languages: Arc<Vec<String>>,
    permits: Arc<Semaphore>,
    clip_id: String,
    path: PathBuf,
}

impl JobContext {
    async fn run(self) -> Result<String, OcrError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OcrError::Abandoned)?;

        let engine = self.engine.clone();
        let languages = self.languages.clone();
        let path = self.path.clone();
        let text = tokio::task::spawn_blocking(move || engine.recognize(&path, &languages))
            .await
            .map_err(|e| OcrError::Engine(format!("recognition task failed: {}", e)))??;
        let text = text.trim().to_string();

        let store = self.store.clone();
        let clip_id = self.clip_id.clone();
        let written = text.clone();
        tokio::task::spawn_blocking(move || store.update_content(&clip_id, &written))
            .await
            .map_err(|e| OcrError::Engine(format!("write-back task failed: {}", e)))?
            .map_err(|e| match e {
                StoreError::NotFound(id) => OcrError::NotFound(id),
                other => OcrError::Store(other),
            })?;

        self.notifier.notify();
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Returns a fixed answer for every image.
    pub struct StaticEngine(pub String);

    impl OcrEngine for StaticEngine {
        fn recognize(&self, _image: &Path, _languages: &[String]) -> Result<String, OcrError> {
            Ok(self.0.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticEngine;
    use super::*;
    use crate::models::{NewClip, NewImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct FailingEngine;

    impl OcrEngine for FailingEngine {
        fn recognize(&self, _image: &Path, _languages: &[String]) -> Result<String, OcrError> {
            Err(OcrError::Engine("no text layer".to_string()))
        }
    }

    /// Blocks until the test releases it.
    struct GateEngine {
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl OcrEngine for GateEngine {
        fn recognize(&self, _image: &Path, _languages: &[String]) -> Result<String, OcrError> {
            let _ = self.release.lock().unwrap().recv();
            Ok("gated".to_string())
        }
    }

    struct CountingEngine {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl OcrEngine for CountingEngine {
        fn recognize(&self, _image: &Path, _languages: &[String]) -> Result<String, OcrError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok("counted".to_string())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ClipStore>,
        notifier: Arc<ChangeNotifier>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ClipStore::open(&dir.path().join("clips.db"), &dir.path().join("images")).unwrap(),
        );
        Fixture {
            _dir: dir,
            store,
            notifier: Arc::new(ChangeNotifier::new()),
        }
    }

    fn coordinator(f: &Fixture, engine: Arc<dyn OcrEngine>, max_concurrent: usize) -> OcrCoordinator {
        OcrCoordinator::new(
            f.store.clone(),
            f.notifier.clone(),
            engine,
            vec!["eng".to_string()],
            max_concurrent,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn successful_job_backfills_content_and_notifies() {
        let f = fixture();
        let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let ocr = coordinator(&f, Arc::new(StaticEngine("  INVOICE 123\n".to_string())), 2);
        let sub = f.notifier.subscribe();

        let job = ocr.submit(&clip.id, clip.image_path().unwrap()).unwrap();
        assert_eq!(job.clip_id(), clip.id);
        assert_eq!(job.wait().await.unwrap(), "INVOICE 123");

        let loaded = f.store.get(&clip.id).unwrap();
        assert_eq!(loaded.content, "INVOICE 123");
        assert!(loaded.kind.is_image());
        assert!(sub.try_recv());
        assert!(!ocr.is_pending(&clip.id));
    }

    #[tokio::test]
    async fn engine_failure_leaves_clip_pending() {
        let f = fixture();
        let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let ocr = coordinator(&f, Arc::new(FailingEngine), 2);

        let err = ocr
            .submit(&clip.id, clip.image_path().unwrap())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::Engine(_)));
        assert!(f.store.get(&clip.id).unwrap().is_pending_ocr());
    }

    #[tokio::test]
    async fn submissions_are_validated() {
        let f = fixture();
        let text = f.store.insert(NewClip::text("plain")).unwrap();
        let image = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let ocr = coordinator(&f, Arc::new(StaticEngine("x".to_string())), 2);

        assert!(matches!(
            ocr.submit("missing", Path::new("/tmp/x.png")),
            Err(OcrError::NotFound(_))
        ));
        assert!(matches!(
            ocr.submit(&text.id, Path::new("/tmp/x.png")),
            Err(OcrError::NotAnImage(_))
        ));
        assert!(matches!(
            ocr.submit(&image.id, Path::new("/elsewhere/other.png")),
            Err(OcrError::PathMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected_while_pending() {
        let f = fixture();
        let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let (release, gate) = mpsc::channel();
        let ocr = coordinator(
            &f,
            Arc::new(GateEngine {
                release: Mutex::new(gate),
            }),
            2,
        );
        let path = clip.image_path().unwrap();

        let job = ocr.submit(&clip.id, path).unwrap();
        assert!(ocr.is_pending(&clip.id));
        assert!(matches!(ocr.submit(&clip.id, path), Err(OcrError::AlreadyPending(_))));

        release.send(()).unwrap();
        assert_eq!(job.wait().await.unwrap(), "gated");
        assert_eq!(ocr.pending_count(), 0);

        release.send(()).unwrap();
        assert!(ocr.submit(&clip.id, path).unwrap().wait().await.is_ok());
    }

    #[tokio::test]
    async fn clip_deleted_mid_job_degrades_to_not_found() {
        let f = fixture();
        let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let (release, gate) = mpsc::channel();
        let ocr = coordinator(
            &f,
            Arc::new(GateEngine {
                release: Mutex::new(gate),
            }),
            1,
        );

        let job = ocr.submit(&clip.id, clip.image_path().unwrap()).unwrap();
        f.store.delete(&clip.id).unwrap();
        release.send(()).unwrap();

        assert!(matches!(job.wait().await, Err(OcrError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrency_is_bounded() {
        let f = fixture();
        let engine = Arc::new(CountingEngine {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let ocr = coordinator(&f, engine.clone(), 1);

        let mut jobs = Vec::new();
        for _ in 0..3 {
            let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
            jobs.push(ocr.submit(&clip.id, clip.image_path().unwrap()).unwrap());
        }
        for job in jobs {
            assert_eq!(job.wait().await.unwrap(), "counted");
        }
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_queued_jobs() {
        let f = fixture();
        let clip = f.store.insert_image(NewImage::png(b"png".to_vec())).unwrap();
        let ocr = coordinator(&f, Arc::new(StaticEngine("late".to_string())), 1);

        ocr.shutdown();
        let job = ocr.submit(&clip.id, clip.image_path().unwrap()).unwrap();
        assert!(matches!(job.wait().await, Err(OcrError::Abandoned)));
        assert!(f.store.get(&clip.id).unwrap().is_pending_ocr());
    }
}
