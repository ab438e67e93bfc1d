//! Clipboard watcher and the clipboard write operations the UI calls.
//!
//! The watcher polls the OS clipboard (event driven on Windows), classifies
//! what it finds, and records it when its fingerprint differs from the last
//! captured item. Reading, comparing and inserting happen under one lock, so
//! the core's own clipboard writes can mark themselves as already seen.

use arboard::{Clipboard, ImageData};
#[cfg(target_os = "windows")]
use clipboard_master::{CallbackResult, ClipboardHandler, Master};
use std::borrow::Cow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::database::{text_fingerprint, ClipStore};
use crate::error::CaptureError;
use crate::events::ChangeNotifier;
use crate::images::{decode_png_rgba, image_fingerprint, prepare_capture, MAX_IMAGE_BYTES};
use crate::models::{Clip, NewClip, NewImage};

const MIN_IMAGE_RECORD_INTERVAL: Duration = Duration::from_millis(1200);
#[cfg(target_os = "windows")]
const EVENT_MONITOR_RETRY_MIN_MS: u64 = 300;
#[cfg(target_os = "windows")]
const EVENT_MONITOR_RETRY_MAX_MS: u64 = 3000;

/// What the clipboard held at the moment it was read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClipboardContent {
    Text(String),
    Image {
        width: usize,
        height: usize,
        rgba: Vec<u8>,
    },
    #[default]
    Empty,
}

/// Access to a system clipboard. `read` only looks for images when asked.
pub trait ClipboardSource: Send {
    fn read(&mut self, want_image: bool) -> Result<ClipboardContent, CaptureError>;
    fn write_text(&mut self, text: &str) -> Result<(), CaptureError>;
    fn write_image(&mut self, width: usize, height: usize, rgba: Vec<u8>) -> Result<(), CaptureError>;
}

/// The OS clipboard through `arboard`. A fresh handle per call, since a
/// long-lived one can go stale when other apps own the clipboard.
#[derive(Default)]
pub struct ArboardClipboard;

impl ArboardClipboard {
    fn open() -> Result<Clipboard, CaptureError> {
        Clipboard::new().map_err(|e| CaptureError::Unavailable(e.to_string()))
    }
}

impl ClipboardSource for ArboardClipboard {
    fn read(&mut self, want_image: bool) -> Result<ClipboardContent, CaptureError> {
        let mut clipboard = Self::open()?;

        if want_image {
            match clipboard.get_image() {
                Ok(image) => {
                    return Ok(ClipboardContent::Image {
                        width: image.width,
                        height: image.height,
                        rgba: image.bytes.into_owned(),
                    })
                }
                Err(arboard::Error::ContentNotAvailable) => {}
                Err(e) => debug!(error = %e, "Clipboard image read failed, trying text"),
            }
        }

        match clipboard.get_text() {
            Ok(text) => Ok(ClipboardContent::Text(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(ClipboardContent::Empty),
            Err(e) => Err(CaptureError::Read(e.to_string())),
        }
    }

    fn write_text(&mut self, text: &str) -> Result<(), CaptureError> {
        Self::open()?
            .set_text(text)
            .map_err(|e| CaptureError::Write(e.to_string()))
    }

    fn write_image(&mut self, width: usize, height: usize, rgba: Vec<u8>) -> Result<(), CaptureError> {
        Self::open()?
            .set_image(ImageData {
                width,
                height,
                bytes: Cow::Owned(rgba),
            })
            .map_err(|e| CaptureError::Write(e.to_string()))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WatcherOptions {
    pub capture_images: bool,
    pub max_text_len: usize,
}

struct WatchState {
    source: Box<dyn ClipboardSource>,
    last_fingerprint: Option<String>,
    last_image_at: Option<Instant>,
}

pub struct ClipboardWatcher {
    store: Arc<ClipStore>,
    notifier: Arc<ChangeNotifier>,
    state: Mutex<WatchState>,
    capture_images: AtomicBool,
    max_text_len: usize,
}

impl ClipboardWatcher {
    /// Seeds the last fingerprint from the newest stored clip, so a restart
    /// does not capture the current clipboard a second time.
    pub fn new(
        store: Arc<ClipStore>,
        notifier: Arc<ChangeNotifier>,
        source: Box<dyn ClipboardSource>,
        options: WatcherOptions,
    ) -> Self {
        let last_fingerprint = match store.latest_fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!(error = %e, "Could not read latest clip fingerprint");
                None
            }
        };

        Self {
            store,
            notifier,
            state: Mutex::new(WatchState {
                source,
                last_fingerprint,
                last_image_at: None,
            }),
            capture_images: AtomicBool::new(options.capture_images),
            max_text_len: options.max_text_len,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_capture_images(&self, enabled: bool) {
        self.capture_images.store(enabled, Ordering::SeqCst);
        info!(enabled, "Image capture toggled");
    }

    pub fn capture_images(&self) -> bool {
        self.capture_images.load(Ordering::SeqCst)
    }

    /// Read the clipboard once and record it if it is new.
    pub fn poll_once(&self) -> Result<Option<Clip>, CaptureError> {
        let mut state = self.lock_state();
        let content = state.source.read(self.capture_images())?;

        match content {
            ClipboardContent::Empty => Ok(None),
            ClipboardContent::Text(text) => Ok(self.capture_text(&mut state, text)),
            ClipboardContent::Image { width, height, rgba } => {
                Ok(self.capture_image(&mut state, width, height, &rgba))
            }
        }
    }

    fn capture_text(&self, state: &mut WatchState, text: String) -> Option<Clip> {
        if text.trim().is_empty() {
            return None;
        }

        let fingerprint = text_fingerprint(&text);
        if state.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return None;
        }

        if text.len() > self.max_text_len {
            warn!(len = text.len(), max = self.max_text_len, "Clipboard text too large, skipped");
            state.last_fingerprint = Some(fingerprint);
            return None;
        }

        match self
            .store
            .insert(NewClip::text(text).with_fingerprint(fingerprint.clone()))
        {
            Ok(clip) => {
                state.last_fingerprint = Some(fingerprint);
                debug!(id = %clip.id, "Captured text clip");
                self.notifier.notify();
                Some(clip)
            }
            Err(e) => {
                // Fingerprint stays put, so the next tick tries again.
                if e.is_corruption() {
                    error!(error = %e, "Failed to store clipboard text");
                } else {
                    warn!(error = %e, "Failed to store clipboard text");
                }
                None
            }
        }
    }

    fn capture_image(&self, state: &mut WatchState, width: usize, height: usize, rgba: &[u8]) -> Option<Clip> {
        let fingerprint = image_fingerprint(width, height, rgba);
        if state.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return None;
        }

        if rgba.len() > MAX_IMAGE_BYTES {
            warn!(width, height, bytes = rgba.len(), "Clipboard image too large, skipped");
            state.last_fingerprint = Some(fingerprint);
            return None;
        }

        // Too soon after the last image: leave the fingerprint alone so a
        // later tick still records this one.
        if let Some(last) = state.last_image_at {
            if last.elapsed() < MIN_IMAGE_RECORD_INTERVAL {
                debug!("Image arrived too soon after the previous one, deferred");
                return None;
            }
        }

        let png = match prepare_capture(width, height, rgba) {
            Ok(png) => png,
            Err(e) => {
                warn!(error = %e, "Clipboard image unusable, skipped");
                state.last_fingerprint = Some(fingerprint);
                return None;
            }
        };

        match self
            .store
            .insert_image(NewImage::png(png).with_fingerprint(fingerprint.clone()))
        {
            Ok(clip) => {
                state.last_fingerprint = Some(fingerprint);
                state.last_image_at = Some(Instant::now());
                debug!(id = %clip.id, width, height, "Captured image clip");
                self.notifier.notify();
                Some(clip)
            }
            Err(e) => {
                warn!(error = %e, "Failed to store clipboard image");
                None
            }
        }
    }

    /// One watcher tick. Capture failures are transient and only logged.
    pub fn tick(&self) {
        if let Err(e) = self.poll_once() {
            warn!(error = %e, "Clipboard read failed, retrying next tick");
        }
    }

    /// Put text on the clipboard without the watcher recording it again.
    pub fn copy_text(&self, text: &str) -> Result<(), CaptureError> {
        let mut state = self.lock_state();
        state.source.write_text(text)?;
        state.last_fingerprint = Some(text_fingerprint(text));
        debug!(len = text.len(), "Copied text to clipboard");
        Ok(())
    }

    /// Put a stored image on the clipboard without recording it again.
    pub fn copy_image(&self, path: &Path) -> Result<(), CaptureError> {
        let (width, height, rgba) = decode_png_rgba(path)?;
        let fingerprint = image_fingerprint(width, height, &rgba);

        let mut state = self.lock_state();
        state.source.write_image(width, height, rgba)?;
        state.last_fingerprint = Some(fingerprint);
        debug!(path = %path.display(), width, height, "Copied image to clipboard");
        Ok(())
    }

    /// Spawn the watcher loop; it runs until the returned task is stopped.
    pub fn start(self: &Arc<Self>, poll_interval: Duration) -> std::io::Result<WatcherTask> {
        #[cfg(target_os = "windows")]
        {
            let _ = poll_interval;
            spawn_event_driven_monitor(self.clone())
        }

        #[cfg(not(target_os = "windows"))]
        {
            spawn_polling_loop(self.clone(), poll_interval)
        }
    }
}

/// Handle to the watcher thread. Dropping it stops the watcher.
pub struct WatcherTask {
    stop: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WatcherTask {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Clipboard watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(not(target_os = "windows"))]
fn spawn_polling_loop(watcher: Arc<ClipboardWatcher>, interval: Duration) -> std::io::Result<WatcherTask> {
    let stop = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel::<()>();
    let stop_flag = stop.clone();

    let handle = thread::Builder::new()
        .name("klip-watcher".to_string())
        .spawn(move || {
            info!(interval_ms = interval.as_millis() as u64, "Clipboard watcher started");
            while !stop_flag.load(Ordering::SeqCst) {
                watcher.tick();
                match wake_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Clipboard watcher stopped");
        })?;

    Ok(WatcherTask {
        stop,
        wake: Some(wake_tx),
        handle: Some(handle),
    })
}

#[cfg(target_os = "windows")]
struct ClipboardEventHandler {
    watcher: Arc<ClipboardWatcher>,
    stop: Arc<AtomicBool>,
}

#[cfg(target_os = "windows")]
impl ClipboardHandler for ClipboardEventHandler {
    fn on_clipboard_change(&mut self) -> CallbackResult {
        if self.stop.load(Ordering::SeqCst) {
            return CallbackResult::Stop;
        }
        self.watcher.tick();
        CallbackResult::Next
    }

    fn on_clipboard_error(&mut self, error: std::io::Error) -> CallbackResult {
        if self.stop.load(Ordering::SeqCst) {
            CallbackResult::Stop
        } else {
            warn!(error = %error, "Clipboard listener error");
            CallbackResult::Next
        }
    }
}

/// The listener thread only returns on the next clipboard event after a
/// stop, so it is detached rather than joined.
#[cfg(target_os = "windows")]
fn spawn_event_driven_monitor(watcher: Arc<ClipboardWatcher>) -> std::io::Result<WatcherTask> {
    let stop = Arc::new(AtomicBool::new(false));
    let (wake_tx, wake_rx) = mpsc::channel::<()>();
    let stop_flag = stop.clone();

    thread::Builder::new()
        .name("klip-watcher".to_string())
        .spawn(move || {
            let mut retry_delay_ms = EVENT_MONITOR_RETRY_MIN_MS;
            watcher.tick();

            while !stop_flag.load(Ordering::SeqCst) {
                let handler = ClipboardEventHandler {
                    watcher: watcher.clone(),
                    stop: stop_flag.clone(),
                };

                match Master::new(handler) {
                    Ok(mut master) => {
                        retry_delay_ms = EVENT_MONITOR_RETRY_MIN_MS;
                        match master.run() {
                            Ok(()) => break,
                            Err(e) => warn!(error = %e, "Clipboard listener stopped unexpectedly"),
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to start clipboard listener"),
                }

                match wake_rx.recv_timeout(Duration::from_millis(retry_delay_ms)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                retry_delay_ms = retry_delay_ms.saturating_mul(2).min(EVENT_MONITOR_RETRY_MAX_MS);
            }
            info!("Clipboard watcher stopped");
        })?;

    info!("Clipboard watcher started (event driven)");
    Ok(WatcherTask {
        stop,
        wake: Some(wake_tx),
        handle: None,
    })
}
