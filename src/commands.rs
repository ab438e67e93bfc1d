//! Operations the presentation layer calls. Every mutation here signals the
//! change notifier once it has committed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::context::HistoryCore;
use crate::error::CommandError;
use crate::events::Subscription;
use crate::models::{Clip, ClipQuery, NewClip, SweepReport};
use crate::ocr::OcrJob;
use crate::settings::CAPTURE_IMAGES;

pub const FAVORITES_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoriteTransferItem {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoriteTransferPackage {
    pub version: u32,
    pub exported_at: String,
    pub favorites: Vec<FavoriteTransferItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FavoriteExportResult {
    pub count: usize,
    pub path: PathBuf,
}

fn require_id(id: &str) -> Result<&str, CommandError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(CommandError::Invalid("id is empty".to_string()));
    }
    Ok(id)
}

pub fn get_clips(
    core: &HistoryCore,
    search_text: Option<&str>,
    date_filter: Option<&str>,
) -> Result<Vec<Clip>, CommandError> {
    Ok(core.queries().get_clips(search_text, date_filter)?)
}

pub fn get_dates_with_clips(core: &HistoryCore) -> Result<Vec<String>, CommandError> {
    Ok(core.queries().get_dates_with_clips()?)
}

pub fn delete_clip(core: &HistoryCore, id: &str) -> Result<(), CommandError> {
    core.store().delete(require_id(id)?)?;
    core.notifier().notify();
    Ok(())
}

pub fn update_clip_content(core: &HistoryCore, id: &str, content: &str) -> Result<(), CommandError> {
    core.store().update_content(require_id(id)?, content)?;
    core.notifier().notify();
    Ok(())
}

pub fn set_clip_favorite(core: &HistoryCore, id: &str, favorite: bool) -> Result<(), CommandError> {
    core.store().set_favorite(require_id(id)?, favorite)?;
    core.notifier().notify();
    Ok(())
}

/// Remove every non-favorite clip. Returns how many went.
pub fn clear_history(core: &HistoryCore) -> Result<usize, CommandError> {
    let deleted = core.store().clear_non_favorites()?;
    if deleted > 0 {
        core.notifier().notify();
    }
    Ok(deleted)
}

pub fn copy_to_clipboard(core: &HistoryCore, content: &str) -> Result<(), CommandError> {
    Ok(core.watcher().copy_text(content)?)
}

pub fn copy_image_to_clipboard(core: &HistoryCore, path: &Path) -> Result<(), CommandError> {
    Ok(core.watcher().copy_image(path)?)
}

pub fn get_setting(core: &HistoryCore, key: &str) -> Option<String> {
    core.settings().get_setting(key)
}

pub fn set_setting(core: &HistoryCore, key: &str, value: &str) -> Result<(), CommandError> {
    core.settings().set_setting(key, value)?;
    if key.trim() == CAPTURE_IMAGES {
        core.watcher().set_capture_images(core.settings().capture_images());
    }
    Ok(())
}

pub fn subscribe(core: &HistoryCore) -> Subscription {
    core.notifier().subscribe()
}

pub fn submit_ocr(core: &HistoryCore, id: &str, image_path: &Path) -> Result<OcrJob, CommandError> {
    Ok(core.ocr().submit(require_id(id)?, image_path)?)
}

pub fn run_retention_sweep(core: &HistoryCore) -> Result<SweepReport, CommandError> {
    Ok(core.retention().sweep()?)
}

fn collect_favorites_package(core: &HistoryCore) -> Result<FavoriteTransferPackage, CommandError> {
    let clips = core.store().query(&ClipQuery::default())?;
    // Oldest first, so an import recreates them in the same order.
    let favorites = clips
        .into_iter()
        .rev()
        .filter(|c| c.is_favorite && !c.kind.is_image())
        .map(|c| FavoriteTransferItem { content: c.content })
        .collect();

    Ok(FavoriteTransferPackage {
        version: FAVORITES_FORMAT_VERSION,
        exported_at: chrono::Local::now().to_rfc3339(),
        favorites,
    })
}

fn import_favorites_from_payload(core: &HistoryCore, payload: &str) -> Result<usize, CommandError> {
    let parsed: FavoriteTransferPackage = serde_json::from_str(payload)?;
    if parsed.version != FAVORITES_FORMAT_VERSION {
        return Err(CommandError::Invalid(format!(
            "unsupported favorites version: {}",
            parsed.version
        )));
    }

    let mut imported = 0;
    for item in parsed.favorites {
        let content = item.content.trim();
        if content.is_empty() || core.store().favorite_text_exists(content)? {
            continue;
        }
        core.store().insert(NewClip::text(content).favorite(true))?;
        imported += 1;
    }

    if imported > 0 {
        core.notifier().notify();
    }
    Ok(imported)
}

/// Write text favorites as JSON. A directory gets a timestamped file name;
/// a bare name gets a `.json` extension.
pub fn export_favorites(core: &HistoryCore, path: &Path) -> Result<FavoriteExportResult, CommandError> {
    if path.as_os_str().is_empty() {
        return Err(CommandError::Invalid("path is empty".to_string()));
    }

    let mut output = path.to_path_buf();
    if output.is_dir() {
        output.push(format!(
            "klip-favorites-{}.json",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ));
    } else if output.extension().is_none() {
        output.set_extension("json");
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let payload = collect_favorites_package(core)?;
    let count = payload.favorites.len();
    std::fs::write(&output, serde_json::to_string_pretty(&payload)?)?;
    info!(count, path = %output.display(), "Exported favorites");

    Ok(FavoriteExportResult { count, path: output })
}

pub fn import_favorites(core: &HistoryCore, path: &Path) -> Result<usize, CommandError> {
    if path.as_os_str().is_empty() {
        return Err(CommandError::Invalid("path is empty".to_string()));
    }
    let json = std::fs::read_to_string(path)?;
    let imported = import_favorites_from_payload(core, &json)?;
    info!(imported, path = %path.display(), "Imported favorites");
    Ok(imported)
}
