//! Clip store: the single owner of clip records and their image files.
//!
//! Reads go through an r2d2 pool of SQLite connections in WAL mode, so
//! queries never wait on the watcher. Writes are funnelled through one lock
//! and run inside an immediate transaction; readers only ever see committed
//! rows.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use deunicode::deunicode_char;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::images::ImageArea;
use crate::models::{Clip, ClipKind, ClipQuery, ImageSource, NewClip, NewImage, Stamp};

pub type DbPool = Pool<SqliteConnectionManager>;

const POOL_SIZE: u32 = 8;
const CLIP_COLUMNS: &str = "id, content, created_at, is_favorite, clip_type, image_path";
// Bumped whenever `search_key` changes, so stored keys get recomputed.
const SEARCH_KEY_VERSION: i64 = 1;

/// Stable fingerprint of a text payload, stored alongside the clip.
pub fn text_fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("text:{}", hex::encode(hasher.finalize()))
}

/// Accent-folded, lowercased form used on both sides of a search.
/// Lowercasing goes char by char so a letter folds the same way wherever
/// it sits in the string.
fn search_key(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars() {
        match deunicode_char(c) {
            Some(ascii) if !c.is_ascii() => folded.push_str(ascii),
            _ => folded.push(c),
        }
    }
    folded.chars().flat_map(char::to_lowercase).collect()
}

/// `%needle%` with LIKE wildcards escaped, for `LIKE ? ESCAPE '\'`.
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in search_key(needle).chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// UTC millis of local midnight starting `date`. A midnight skipped by a
/// DST jump resolves to the first valid local instant after it.
fn local_day_start_ms(date: NaiveDate) -> i64 {
    let naive = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| Local.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| naive.and_utc().timestamp_millis())
}

fn local_day_bounds_ms(date: NaiveDate) -> (i64, i64) {
    let start = local_day_start_ms(date);
    let end = date.succ_opt().map(local_day_start_ms).unwrap_or(i64::MAX);
    (start, end)
}

fn millis_to_utc(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn clip_from_row(row: &Row) -> rusqlite::Result<Clip> {
    let clip_type: String = row.get(4)?;
    let image_path: Option<String> = row.get(5)?;
    let kind = match (clip_type.as_str(), image_path) {
        ("image", Some(path)) => ClipKind::Image {
            image_path: PathBuf::from(path),
        },
        ("text", _) => ClipKind::Text,
        (other, _) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                Type::Text,
                format!("unexpected clip_type '{}' or missing image_path", other).into(),
            ))
        }
    };

    Ok(Clip {
        id: row.get(0)?,
        content: row.get(1)?,
        created_at: millis_to_utc(row.get(2)?, 2)?,
        is_favorite: row.get::<_, i64>(3)? != 0,
        kind,
    })
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS clips (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL DEFAULT '',
            search_content TEXT NOT NULL DEFAULT '',
            content_hash TEXT,
            created_at INTEGER NOT NULL,
            is_favorite INTEGER NOT NULL DEFAULT 0,
            clip_type TEXT NOT NULL DEFAULT 'text' CHECK (clip_type IN ('text', 'image')),
            image_path TEXT,
            CHECK ((clip_type = 'image') = (image_path IS NOT NULL))
        )",
        [],
    )?;

    ensure_clip_columns(conn)?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clips_created_at ON clips(created_at DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clips_favorite_created ON clips(is_favorite, created_at)",
        [],
    )?;

    Ok(())
}

/// Columns added after the first schema; older databases get them here.
fn ensure_clip_columns(conn: &Connection) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare("PRAGMA table_info(clips)")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if !columns.iter().any(|c| c == "content_hash") {
        conn.execute("ALTER TABLE clips ADD COLUMN content_hash TEXT", [])?;
        info!("Migrated clips: added content_hash column");
    }

    if !columns.iter().any(|c| c == "search_content") {
        conn.execute(
            "ALTER TABLE clips ADD COLUMN search_content TEXT NOT NULL DEFAULT ''",
            [],
        )?;
        info!("Migrated clips: added search_content column");
    }

    // Rows written before the column existed, or under an older key
    // scheme, get their search keys recomputed.
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let filter = if version < SEARCH_KEY_VERSION {
        "content <> ''"
    } else {
        "search_content = '' AND content <> ''"
    };
    let stale = {
        let mut stmt = conn.prepare(&format!("SELECT id, content FROM clips WHERE {}", filter))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    for (id, content) in &stale {
        conn.execute(
            "UPDATE clips SET search_content = ?1 WHERE id = ?2",
            params![search_key(content), id],
        )?;
    }
    if !stale.is_empty() {
        info!(count = stale.len(), "Backfilled search_content");
    }
    if version < SEARCH_KEY_VERSION {
        conn.pragma_update(None, "user_version", SEARCH_KEY_VERSION)?;
    }

    Ok(())
}

fn open_pool(db_path: &Path) -> Result<DbPool, StoreError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
    });

    let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
    Ok(pool)
}

/// The one writer of a database file. Clip and settings changes both go
/// through `run`, so a corruption error suspends every write until
/// `ClipStore::reconcile` lifts it.
pub struct DbWriter {
    pool: DbPool,
    lock: Mutex<()>,
    suspended: AtomicBool,
}

impl DbWriter {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            lock: Mutex::new(()),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Run `f` as the only writer, inside an immediate transaction.
    /// Nothing is committed unless `f` succeeds.
    pub fn run<T>(&self, f: impl FnOnce(&Transaction) -> Result<T, StoreError>) -> Result<T, StoreError> {
        if self.is_suspended() {
            return Err(StoreError::WritesSuspended);
        }

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result: Result<T, StoreError> = (|| {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })();

        if let Err(ref e) = result {
            if e.is_corruption() {
                self.suspended.store(true, Ordering::SeqCst);
                error!(error = %e, "Database corruption detected, suspending writes");
            }
        }
        result
    }

    fn resume(&self) -> bool {
        self.suspended.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn suspend_for_test(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }
}

pub struct ClipStore {
    pool: DbPool,
    images: ImageArea,
    writer: Arc<DbWriter>,
}

impl ClipStore {
    pub fn open(db_path: &Path, images_dir: &Path) -> Result<Self, StoreError> {
        let pool = open_pool(db_path)?;
        let images = ImageArea::open(images_dir)?;
        {
            let conn = pool.get()?;
            init_schema(&conn)?;
        }
        info!(images_dir = %images.dir().display(), "Clip store opened");

        Ok(Self {
            writer: Arc::new(DbWriter::new(pool.clone())),
            pool,
            images,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The writer shared with anything else persisting into this database.
    pub fn writer(&self) -> &Arc<DbWriter> {
        &self.writer
    }

    pub fn images_dir(&self) -> &Path {
        self.images.dir()
    }

    pub fn writes_suspended(&self) -> bool {
        self.writer.is_suspended()
    }

    fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction) -> Result<T, StoreError>) -> Result<T, StoreError> {
        self.writer.run(f)
    }

    /// Newest `created_at` for live captures, never behind what is stored.
    fn resolve_stamp(tx: &Transaction, stamp: Stamp) -> Result<i64, StoreError> {
        match stamp {
            Stamp::At(at) => Ok(at.timestamp_millis()),
            Stamp::Now => {
                let newest: Option<i64> =
                    tx.query_row("SELECT MAX(created_at) FROM clips", [], |row| row.get(0))?;
                let now = Utc::now().timestamp_millis();
                Ok(newest.map_or(now, |newest| now.max(newest)))
            }
        }
    }

    /// Persist a new text clip.
    pub fn insert(&self, clip: NewClip) -> Result<Clip, StoreError> {
        if clip.content.is_empty() {
            return Err(StoreError::Invalid("text clip content cannot be empty".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let fingerprint = clip
            .fingerprint
            .clone()
            .unwrap_or_else(|| text_fingerprint(&clip.content));

        let created_ms = self.write(|tx| {
            let created_ms = Self::resolve_stamp(tx, clip.stamp)?;
            tx.execute(
                "INSERT INTO clips (id, content, search_content, content_hash, created_at, is_favorite, clip_type, image_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'text', NULL)",
                params![
                    &id,
                    &clip.content,
                    search_key(&clip.content),
                    &fingerprint,
                    created_ms,
                    clip.is_favorite as i32,
                ],
            )?;
            Ok(created_ms)
        })?;

        debug!(id = %id, len = clip.content.len(), "Inserted text clip");
        Ok(Clip {
            id,
            content: clip.content,
            created_at: millis_to_utc(created_ms, 2)?,
            is_favorite: clip.is_favorite,
            kind: ClipKind::Text,
        })
    }

    /// Persist a new image clip together with its backing file. The file is
    /// written first; if the record cannot be committed the file is removed
    /// again, and a crash in between leaves an orphan for the next sweep.
    pub fn insert_image(&self, image: NewImage) -> Result<Clip, StoreError> {
        let id = Uuid::new_v4().to_string();

        let (created_ms, path) = self.write(|tx| {
            let path = match &image.source {
                ImageSource::Png(png) => self.images.write(&id, png)?,
                ImageSource::Adopt(path) => {
                    if !path.is_file() {
                        return Err(StoreError::Invalid(format!(
                            "image file does not exist: {}",
                            path.display()
                        )));
                    }
                    path.clone()
                }
            };

            let inserted = Self::resolve_stamp(tx, image.stamp).and_then(|created_ms| {
                tx.execute(
                    "INSERT INTO clips (id, content, search_content, content_hash, created_at, is_favorite, clip_type, image_path)
                     VALUES (?1, '', '', ?2, ?3, ?4, 'image', ?5)",
                    params![
                        &id,
                        &image.fingerprint,
                        created_ms,
                        image.is_favorite as i32,
                        path.to_string_lossy().into_owned(),
                    ],
                )?;
                Ok(created_ms)
            });

            match inserted {
                Ok(created_ms) => Ok((created_ms, path)),
                Err(e) => {
                    if matches!(image.source, ImageSource::Png(_)) {
                        self.images.remove(&path);
                    }
                    Err(e)
                }
            }
        })?;

        debug!(id = %id, path = %path.display(), "Inserted image clip");
        Ok(Clip {
            id,
            content: String::new(),
            created_at: millis_to_utc(created_ms, 2)?,
            is_favorite: image.is_favorite,
            kind: ClipKind::Image { image_path: path },
        })
    }

    pub fn get(&self, id: &str) -> Result<Clip, StoreError> {
        let conn = self.reader()?;
        conn.query_row(
            &format!("SELECT {} FROM clips WHERE id = ?1", CLIP_COLUMNS),
            params![id],
            clip_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Delete the rows matching `predicate`, then their image files.
    fn delete_matching(&self, predicate: &str, args: &[&dyn ToSql]) -> Result<usize, StoreError> {
        let (count, paths) = self.write(|tx| {
            let paths = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT image_path FROM clips WHERE image_path IS NOT NULL AND ({})",
                    predicate
                ))?;
                let rows = stmt
                    .query_map(args, |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            let count = tx.execute(&format!("DELETE FROM clips WHERE {}", predicate), args)?;
            Ok((count, paths))
        })?;

        // Record first, file second: an interrupted removal leaves an orphan
        // file for the sweep, never a record pointing at nothing.
        for path in &paths {
            self.images.remove(Path::new(path));
        }
        Ok(count)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        match self.delete_matching("id = ?1", &[&id])? {
            0 => Err(StoreError::NotFound(id.to_string())),
            _ => {
                info!(id = %id, "Deleted clip");
                Ok(())
            }
        }
    }

    pub fn update_content(&self, id: &str, text: &str) -> Result<(), StoreError> {
        self.write(|tx| {
            let clip_type: Option<String> = tx
                .query_row("SELECT clip_type FROM clips WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;

            match clip_type.as_deref() {
                None => return Err(StoreError::NotFound(id.to_string())),
                Some("text") if text.is_empty() => {
                    return Err(StoreError::Invalid("text clip content cannot be empty".to_string()))
                }
                Some("text") => {
                    tx.execute(
                        "UPDATE clips SET content = ?1, search_content = ?2, content_hash = ?3 WHERE id = ?4",
                        params![text, search_key(text), text_fingerprint(text), id],
                    )?;
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE clips SET content = ?1, search_content = ?2 WHERE id = ?3",
                        params![text, search_key(text), id],
                    )?;
                }
            }
            Ok(())
        })?;

        debug!(id = %id, text_len = text.len(), "Updated clip content");
        Ok(())
    }

    pub fn set_favorite(&self, id: &str, favorite: bool) -> Result<(), StoreError> {
        let affected = self.write(|tx| {
            Ok(tx.execute(
                "UPDATE clips SET is_favorite = ?1 WHERE id = ?2",
                params![favorite as i32, id],
            )?)
        })?;

        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        info!(id = %id, favorite, "Updated clip favorite state");
        Ok(())
    }

    /// Clips newest first, filtered by case-insensitive substring and/or
    /// local calendar date.
    pub fn query(&self, query: &ClipQuery) -> Result<Vec<Clip>, StoreError> {
        let mut sql = format!("SELECT {} FROM clips WHERE 1=1", CLIP_COLUMNS);
        let mut args: Vec<Value> = Vec::new();

        if let Some(search) = &query.search_text {
            sql.push_str(" AND search_content LIKE ? ESCAPE '\\'");
            args.push(Value::Text(like_pattern(search)));
        }

        if let Some(date) = query.date_filter {
            let (start, end) = local_day_bounds_ms(date);
            sql.push_str(" AND created_at >= ? AND created_at < ?");
            args.push(Value::Integer(start));
            args.push(Value::Integer(end));
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let clips = stmt
            .query_map(params_from_iter(args.iter()), clip_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        debug!(count = clips.len(), "Queried clips");
        Ok(clips)
    }

    /// Every local calendar date holding at least one clip, newest first.
    pub fn list_distinct_dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT created_at FROM clips")?;
        let mut dates = BTreeSet::new();
        for ms in stmt.query_map([], |row| row.get::<_, i64>(0))? {
            let created = millis_to_utc(ms?, 0)?;
            dates.insert(created.with_timezone(&Local).date_naive());
        }
        Ok(dates.into_iter().rev().collect())
    }

    /// Fingerprint of the most recently captured clip.
    pub fn latest_fingerprint(&self) -> Result<Option<String>, StoreError> {
        let conn = self.reader()?;
        let row: Option<(Option<String>, String, String)> = conn
            .query_row(
                "SELECT content_hash, clip_type, content FROM clips
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.and_then(|(hash, clip_type, content)| match hash {
            Some(hash) => Some(hash),
            None if clip_type == "text" => Some(text_fingerprint(&content)),
            None => None,
        }))
    }

    /// Remove non-favorite clips created before `cutoff`.
    pub fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.delete_matching("is_favorite = 0 AND created_at < ?1", &[&cutoff_ms])
    }

    /// Keep only the newest `max_records` non-favorite clips.
    pub fn trim_to(&self, max_records: usize) -> Result<usize, StoreError> {
        let max_records = i64::try_from(max_records).unwrap_or(i64::MAX);
        self.delete_matching(
            "is_favorite = 0 AND id NOT IN (
                SELECT id FROM clips WHERE is_favorite = 0
                ORDER BY created_at DESC, rowid DESC LIMIT ?1
            )",
            &[&max_records],
        )
    }

    pub fn clear_non_favorites(&self) -> Result<usize, StoreError> {
        let deleted = self.delete_matching("is_favorite = 0", &[])?;
        info!(deleted, "Cleared non-favorite history");
        Ok(deleted)
    }

    /// Bring records and image files back in line: records whose file
    /// vanished are dropped, files no record owns are deleted.
    /// Returns `(orphaned_files, dangling_records)`.
    pub fn reconcile_images(&self) -> Result<(usize, usize), StoreError> {
        self.write(|tx| {
            let rows = {
                let mut stmt =
                    tx.prepare("SELECT id, image_path FROM clips WHERE image_path IS NOT NULL")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut referenced = HashSet::new();
            let mut dangling = 0;
            for (id, path) in rows {
                let path = PathBuf::from(path);
                if path.exists() {
                    referenced.insert(path);
                } else {
                    warn!(id = %id, path = %path.display(), "Image file missing, dropping record");
                    tx.execute("DELETE FROM clips WHERE id = ?1", params![id])?;
                    dangling += 1;
                }
            }

            let orphaned = self.images.gc_orphans(&referenced)?;
            Ok((orphaned, dangling))
        })
    }

    pub fn favorite_text_exists(&self, content: &str) -> Result<bool, StoreError> {
        let conn = self.reader()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM clips
                WHERE is_favorite = 1 AND clip_type = 'text' AND content = ?1
            )",
            params![content],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM clips", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Fold the WAL back into the main file so it does not grow unbounded.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.reader()?;
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    /// Verify the database and lift a write suspension if it is healthy.
    pub fn reconcile(&self) -> Result<bool, StoreError> {
        let conn = self.reader()?;
        let status: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if status == "ok" {
            if self.writer.resume() {
                info!("Integrity check passed, writes resumed");
            }
            Ok(true)
        } else {
            error!(status = %status, "Integrity check failed");
            Ok(false)
        }
    }

    #[cfg(test)]
    pub(crate) fn suspend_writes_for_test(&self) {
        self.writer.suspend_for_test();
    }
}
