use thiserror::Error;

/// OS clipboard could not be read or written. Always transient.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("failed to read clipboard: {0}")]
    Read(String),
    #[error("failed to write clipboard: {0}")]
    Write(String),
    #[error("unusable clipboard image: {0}")]
    Image(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clip not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("writes suspended until the store is reconciled")]
    WritesSuspended,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Errors that mean the database file itself is damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("an OCR job is already pending for clip {0}")]
    AlreadyPending(String),
    #[error("clip not found: {0}")]
    NotFound(String),
    #[error("clip {0} is not an image")]
    NotAnImage(String),
    #[error("image path {given} does not match the stored path of clip {id}")]
    PathMismatch { id: String, given: String },
    #[error("recognition engine failed: {0}")]
    Engine(String),
    #[error("job abandoned before completion")]
    Abandoned,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of an operation exposed to the presentation layer.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid favorites file: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommandError {
    pub fn is_not_found(&self) -> bool {
        match self {
            CommandError::Store(e) => e.is_not_found(),
            CommandError::Ocr(OcrError::NotFound(_)) => true,
            _ => false,
        }
    }
}
