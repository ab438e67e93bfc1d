pub mod clipboard;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod events;
pub mod images;
pub mod logging;
pub mod models;
pub mod ocr;
pub mod query;
pub mod retention;
pub mod settings;

pub use clipboard::{ArboardClipboard, ClipboardContent, ClipboardSource, ClipboardWatcher};
pub use config::Config;
pub use context::HistoryCore;
pub use database::ClipStore;
pub use error::{CaptureError, CommandError, OcrError, StoreError};
pub use events::{ChangeNotifier, Subscription};
pub use models::{Clip, ClipKind, ClipQuery, NewClip, NewImage, SweepReport};
pub use ocr::{OcrCoordinator, OcrEngine, OcrJob, TesseractEngine};
