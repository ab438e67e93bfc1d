//! Image file area and raw clipboard image handling.
//!
//! Files live in `<data_dir>/images/<clip id>.png`. Only the clip store
//! writes or removes them; this module just knows how.

use image::{codecs::png::PngEncoder, ColorType, ImageEncoder, ImageFormat};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CaptureError, StoreError};

pub const MAX_IMAGE_BYTES: usize = 48 * 1024 * 1024; // raw RGBA cap before processing
const MAX_IMAGE_PIXELS: usize = 2_600_000; // approx <= 1920x1350
const MAX_IMAGE_DIMENSION: usize = 2200;
const MAX_ENCODED_IMAGE_BYTES: usize = 6 * 1024 * 1024;
const SIGNATURE_SAMPLE_BYTES: usize = 4096;

pub struct ImageArea {
    dir: PathBuf,
}

impl ImageArea {
    /// The directory is resolved to its absolute form, so stored paths
    /// stay valid however the data dir was spelled on the command line.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let dir = fs::canonicalize(&dir)?;
        Ok(Self { dir })
    }

    fn contains(&self, path: &Path) -> bool {
        path.parent()
            .and_then(|parent| fs::canonicalize(parent).ok())
            .is_some_and(|parent| parent == self.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.png", id))
    }

    /// Write through a temp file and rename, so a crash never leaves a
    /// half-written PNG under a clip's name.
    pub fn write(&self, id: &str, png: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path_for(id);
        let tmp = self.dir.join(format!("{}.png.tmp", id));
        fs::write(&tmp, png)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(id = %id, size = png.len(), "Stored image file");
        Ok(path)
    }

    /// Remove an owned file. Returns false if it was already gone.
    pub fn remove(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted image file");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete image file");
                false
            }
        }
    }

    /// Delete files in the image directory that no record references,
    /// including temp files left by an interrupted write.
    pub fn gc_orphans(&self, referenced: &HashSet<PathBuf>) -> Result<usize, StoreError> {
        let referenced_names: HashSet<OsString> = referenced
            .iter()
            .filter(|p| self.contains(p))
            .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
            .collect();

        let mut deleted = 0;
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_ours = path
                .extension()
                .is_some_and(|ext| ext == "png" || ext == "tmp");
            let Some(name) = path.file_name() else {
                continue;
            };
            if is_ours && !referenced_names.contains(name) && self.remove(&path) {
                deleted += 1;
            }
        }

        if deleted > 0 {
            debug!(deleted, "Removed orphaned image files");
        }
        Ok(deleted)
    }
}

pub fn encode_rgba_to_png(width: usize, height: usize, rgba: &[u8]) -> Result<Vec<u8>, CaptureError> {
    let mut out = Vec::new();
    let encoder = PngEncoder::new(&mut out);
    encoder
        .write_image(rgba, width as u32, height as u32, ColorType::Rgba8.into())
        .map_err(|e| CaptureError::Image(e.to_string()))?;
    Ok(out)
}

fn downscale_rgba_nearest(
    width: usize,
    height: usize,
    rgba: &[u8],
    target_width: usize,
    target_height: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; target_width * target_height * 4];
    for ty in 0..target_height {
        let sy = ty * height / target_height;
        for tx in 0..target_width {
            let sx = tx * width / target_width;
            let src = (sy * width + sx) * 4;
            let dst = (ty * target_width + tx) * 4;
            out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
    }
    out
}

fn normalize_for_storage(width: usize, height: usize, rgba: &[u8]) -> (usize, usize, Cow<'_, [u8]>) {
    let mut ratio: f64 = 1.0;
    if width > MAX_IMAGE_DIMENSION {
        ratio = ratio.max(width as f64 / MAX_IMAGE_DIMENSION as f64);
    }
    if height > MAX_IMAGE_DIMENSION {
        ratio = ratio.max(height as f64 / MAX_IMAGE_DIMENSION as f64);
    }
    let pixels = width.saturating_mul(height);
    if pixels > MAX_IMAGE_PIXELS {
        ratio = ratio.max((pixels as f64 / MAX_IMAGE_PIXELS as f64).sqrt());
    }

    if ratio <= 1.0 {
        return (width, height, Cow::Borrowed(rgba));
    }

    let target_width = ((width as f64 / ratio).round() as usize).max(1);
    let target_height = ((height as f64 / ratio).round() as usize).max(1);
    let resized = downscale_rgba_nearest(width, height, rgba, target_width, target_height);
    (target_width, target_height, Cow::Owned(resized))
}

/// Turn a raw RGBA capture into PNG bytes ready for the store, enforcing
/// the size caps.
pub fn prepare_capture(width: usize, height: usize, rgba: &[u8]) -> Result<Vec<u8>, CaptureError> {
    if width == 0 || height == 0 {
        return Err(CaptureError::Image("empty image".to_string()));
    }
    if rgba.len() > MAX_IMAGE_BYTES {
        return Err(CaptureError::Image(format!(
            "raw image too large: {} bytes > {} bytes",
            rgba.len(),
            MAX_IMAGE_BYTES
        )));
    }
    if rgba.len() != width * height * 4 {
        return Err(CaptureError::Image(format!(
            "expected {} RGBA bytes for {}x{}, got {}",
            width * height * 4,
            width,
            height,
            rgba.len()
        )));
    }

    let (w, h, pixels) = normalize_for_storage(width, height, rgba);
    let png = encode_rgba_to_png(w, h, pixels.as_ref())?;
    if png.len() > MAX_ENCODED_IMAGE_BYTES {
        return Err(CaptureError::Image(format!(
            "encoded image too large: {} bytes > {} bytes",
            png.len(),
            MAX_ENCODED_IMAGE_BYTES
        )));
    }
    Ok(png)
}

/// Fingerprint of a raw image. Samples both ends of the buffer instead of
/// hashing it all; dimensions and length disambiguate the rest.
pub fn image_fingerprint(width: usize, height: usize, rgba: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((width as u64).to_le_bytes());
    hasher.update((height as u64).to_le_bytes());
    hasher.update((rgba.len() as u64).to_le_bytes());
    let head = &rgba[..rgba.len().min(SIGNATURE_SAMPLE_BYTES)];
    let tail = &rgba[rgba.len().saturating_sub(SIGNATURE_SAMPLE_BYTES)..];
    hasher.update(head);
    hasher.update(tail);
    format!("image:{}", hex::encode(hasher.finalize()))
}

pub fn decode_png_rgba(path: &Path) -> Result<(usize, usize, Vec<u8>), CaptureError> {
    let bytes = fs::read(path).map_err(|e| CaptureError::Image(format!("{}: {}", path.display(), e)))?;
    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
        .or_else(|_| image::load_from_memory(&bytes))
        .map_err(|e| CaptureError::Image(e.to_string()))?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok((width as usize, height as usize, rgba.into_raw()))
}
