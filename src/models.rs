use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-variant payload of a clip. Serialized flat next to the clip fields
/// as `clip_type` plus `image_path` for images.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "clip_type", rename_all = "lowercase")]
pub enum ClipKind {
    Text,
    Image { image_path: PathBuf },
}

impl ClipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipKind::Text => "text",
            ClipKind::Image { .. } => "image",
        }
    }

    pub fn image_path(&self) -> Option<&Path> {
        match self {
            ClipKind::Text => None,
            ClipKind::Image { image_path } => Some(image_path),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ClipKind::Image { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    /// Text payload. For images this is the OCR text, empty until backfilled.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_favorite: bool,
    #[serde(flatten)]
    pub kind: ClipKind,
}

impl Clip {
    pub fn image_path(&self) -> Option<&Path> {
        self.kind.image_path()
    }

    /// Image clip whose text has not been extracted yet.
    pub fn is_pending_ocr(&self) -> bool {
        self.kind.is_image() && self.content.is_empty()
    }
}

/// When a new clip is stamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stamp {
    /// Current time, never earlier than the newest stored clip.
    Now,
    /// Stored verbatim (imports, tests).
    At(DateTime<Utc>),
}

/// A text clip about to be inserted. Image clips go through
/// `ClipStore::insert_image`, which also writes the backing file.
#[derive(Clone, Debug)]
pub struct NewClip {
    pub content: String,
    pub is_favorite: bool,
    pub stamp: Stamp,
    pub fingerprint: Option<String>,
}

impl NewClip {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_favorite: false,
            stamp: Stamp::Now,
            fingerprint: None,
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.stamp = Stamp::At(created_at);
        self
    }

    pub fn favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: String) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

/// Where the backing file of a new image clip comes from.
#[derive(Clone, Debug)]
pub enum ImageSource {
    /// Encoded PNG, written into the image directory under the clip id.
    Png(Vec<u8>),
    /// An existing file the store takes ownership of; deleting the clip
    /// deletes the file.
    Adopt(PathBuf),
}

#[derive(Clone, Debug)]
pub struct NewImage {
    pub source: ImageSource,
    pub is_favorite: bool,
    pub stamp: Stamp,
    pub fingerprint: Option<String>,
}

impl NewImage {
    pub fn png(png: Vec<u8>) -> Self {
        Self::from_source(ImageSource::Png(png))
    }

    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self::from_source(ImageSource::Adopt(path.into()))
    }

    fn from_source(source: ImageSource) -> Self {
        Self {
            source,
            is_favorite: false,
            stamp: Stamp::Now,
            fingerprint: None,
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.stamp = Stamp::At(created_at);
        self
    }

    pub fn favorite(mut self, is_favorite: bool) -> Self {
        self.is_favorite = is_favorite;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: String) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClipQuery {
    pub search_text: Option<String>,
    pub date_filter: Option<NaiveDate>,
    pub limit: Option<usize>,
}

/// Outcome of one retention sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub trimmed: usize,
    pub orphaned_files: usize,
    pub dangling_records: usize,
}

impl SweepReport {
    pub fn changed_records(&self) -> bool {
        self.expired + self.trimmed + self.dangling_records > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_serializes_flat_with_clip_type() {
        let clip = Clip {
            id: "a".to_string(),
            content: String::new(),
            created_at: DateTime::from_timestamp_millis(0).unwrap(),
            is_favorite: false,
            kind: ClipKind::Image {
                image_path: PathBuf::from("/data/a.png"),
            },
        };
        let json = serde_json::to_value(&clip).unwrap();
        assert_eq!(json["clip_type"], "image");
        assert_eq!(json["image_path"], "/data/a.png");
        assert!(clip.is_pending_ocr());

        let back: Clip = serde_json::from_value(json).unwrap();
        assert_eq!(back, clip);
    }

    #[test]
    fn text_clip_has_no_image_path() {
        let json = serde_json::json!({
            "id": "b",
            "content": "hello",
            "created_at": "2024-01-01T00:00:00Z",
            "is_favorite": true,
            "clip_type": "text"
        });
        let clip: Clip = serde_json::from_value(json).unwrap();
        assert_eq!(clip.kind, ClipKind::Text);
        assert!(clip.image_path().is_none());
        assert!(!clip.is_pending_ocr());
    }
}
