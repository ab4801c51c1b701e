use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::metadata::TrackTags;

use super::hash::FileStamp;
use super::scanner::RootKind;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INDEX_DIR_NAME: &str = ".rocksync";
const INDEX_FILE_NAME: &str = "music_index.sqlite3";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// One row of the `tracks` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackRecord {
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub albumartist: String,
    pub genre: String,
    pub track: String,
    pub disc: String,
    pub year: String,
    pub date: String,
    pub composer: String,
    pub comment: String,
    pub duration_seconds: i64,
    pub format: String,
    pub mtime: i64,
    pub size: i64,
    pub content_hash: Option<String>,
}

impl TrackRecord {
    pub fn from_tags(path: &Path, tags: TrackTags, stamp: FileStamp) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            title: tags.title,
            artist: tags.artist,
            album: tags.album,
            albumartist: tags.albumartist,
            genre: tags.genre,
            track: tags.track,
            disc: tags.disc,
            year: tags.year,
            date: tags.date,
            composer: tags.composer,
            comment: tags.comment,
            duration_seconds: tags.duration_seconds,
            format: tags.format,
            mtime: stamp.mtime,
            size: stamp.size,
            content_hash: None,
        }
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            mtime: self.mtime,
            size: self.size,
        }
    }

    /// The stored hash, if it still describes the bytes at `current`.
    pub fn trusted_hash(&self, current: FileStamp) -> Option<&str> {
        if self.stamp() != current {
            return None;
        }
        self.content_hash.as_deref().filter(|hash| !hash.is_empty())
    }
}

/// Persistent per-root track table. Clones share the pool and the write lock,
/// so at most one writer touches a given store at a time.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, IndexError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_library_default() -> Result<Self, IndexError> {
        Self::open(&library_db_path()?).await
    }

    /// Opens the store that belongs to `root`: the shared library store, or
    /// the one on the device holding `root`.
    pub async fn open_for(kind: RootKind, root: &Path) -> Result<Self, IndexError> {
        match kind {
            RootKind::Library => Self::open_library_default().await,
            RootKind::Device => Self::open(&device_db_path_for_root(root)).await,
        }
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        self.ensure_hash_column().await
    }

    // Stores written before fingerprints existed lack the md5 column.
    async fn ensure_hash_column(&self) -> Result<(), IndexError> {
        let columns = sqlx::query("PRAGMA table_info(tracks)")
            .fetch_all(&self.pool)
            .await?;
        let has_hash = columns
            .iter()
            .any(|row| row.try_get::<String, _>("name").is_ok_and(|name| name == "md5"));
        if !has_hash {
            sqlx::query("ALTER TABLE tracks ADD COLUMN md5 TEXT")
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Inserts or replaces the row for `record.path`. A record without a hash
    /// keeps the stored one as long as `(mtime, size)` did not move.
    pub async fn upsert(&self, record: &TrackRecord) -> Result<(), IndexError> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO tracks (
                path, title, artist, album, albumartist, genre, track, disc, year, date,
                composer, comment, duration_seconds, format, mtime, size, md5
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                artist = excluded.artist,
                album = excluded.album,
                albumartist = excluded.albumartist,
                genre = excluded.genre,
                track = excluded.track,
                disc = excluded.disc,
                year = excluded.year,
                date = excluded.date,
                composer = excluded.composer,
                comment = excluded.comment,
                duration_seconds = excluded.duration_seconds,
                format = excluded.format,
                md5 = CASE
                    WHEN excluded.md5 IS NOT NULL THEN excluded.md5
                    WHEN tracks.mtime = excluded.mtime AND tracks.size = excluded.size THEN tracks.md5
                    ELSE NULL
                END,
                mtime = excluded.mtime,
                size = excluded.size",
        )
        .bind(&record.path)
        .bind(&record.title)
        .bind(&record.artist)
        .bind(&record.album)
        .bind(&record.albumartist)
        .bind(&record.genre)
        .bind(&record.track)
        .bind(&record.disc)
        .bind(&record.year)
        .bind(&record.date)
        .bind(&record.composer)
        .bind(&record.comment)
        .bind(record.duration_seconds)
        .bind(&record.format)
        .bind(record.mtime)
        .bind(record.size)
        .bind(&record.content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup(&self, path: &str) -> Result<Option<TrackRecord>, IndexError> {
        let row = sqlx::query(&format!("{SELECT_TRACKS} WHERE path = ?1"))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    /// Every row whose path lies under `root` (component-wise).
    pub async fn all_under(&self, root: &Path) -> Result<Vec<TrackRecord>, IndexError> {
        let root_str = root.to_string_lossy();
        let pattern = format!("{}/%", escape_like(root_str.trim_end_matches('/')));
        let rows = sqlx::query(&format!(
            "{SELECT_TRACKS} WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path ASC"
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            if Path::new(&record.path).starts_with(root) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub async fn all(&self) -> Result<Vec<TrackRecord>, IndexError> {
        let rows = sqlx::query(&format!("{SELECT_TRACKS} ORDER BY path ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| record_from_row(row).map_err(IndexError::from))
            .collect()
    }

    pub async fn delete(&self, path: &str) -> Result<(), IndexError> {
        let _guard = self.writer.lock().await;
        sqlx::query("DELETE FROM tracks WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_hash(&self, path: &str, hash: &str) -> Result<(), IndexError> {
        let _guard = self.writer.lock().await;
        sqlx::query("UPDATE tracks SET md5 = ?1 WHERE path = ?2")
            .bind(hash)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes a batch of `(path, hash)` pairs in one transaction.
    pub async fn set_hashes(&self, batch: &[(String, String)]) -> Result<(), IndexError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        for (path, hash) in batch {
            sqlx::query("UPDATE tracks SET md5 = ?1 WHERE path = ?2")
                .bind(hash)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tracks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

const SELECT_TRACKS: &str = "SELECT path, title, artist, album, albumartist, genre, track, disc, year, date, composer, comment, duration_seconds, format, mtime, size, md5 FROM tracks";

fn record_from_row(row: &SqliteRow) -> Result<TrackRecord, sqlx::Error> {
    // Legacy stores may hold NULLs in any tag column.
    let text = |name: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    };
    Ok(TrackRecord {
        path: row.try_get("path")?,
        title: text("title")?,
        artist: text("artist")?,
        album: text("album")?,
        albumartist: text("albumartist")?,
        genre: text("genre")?,
        track: text("track")?,
        disc: text("disc")?,
        year: text("year")?,
        date: text("date")?,
        composer: text("composer")?,
        comment: text("comment")?,
        duration_seconds: row
            .try_get::<Option<i64>, _>("duration_seconds")?
            .unwrap_or_default(),
        format: text("format")?,
        mtime: row.try_get::<Option<i64>, _>("mtime")?.unwrap_or_default(),
        size: row.try_get::<Option<i64>, _>("size")?.unwrap_or_default(),
        content_hash: row.try_get("md5")?,
    })
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub fn library_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("rocksync");
    path.push(INDEX_FILE_NAME);
    Ok(path)
}

/// Device stores live in a hidden directory at the mount point, next to the
/// `Music` folder being mirrored.
pub fn device_db_path(mountpoint: &Path) -> PathBuf {
    mountpoint.join(INDEX_DIR_NAME).join(INDEX_FILE_NAME)
}

/// Resolves the device store for a device music root (`<mount>/Music`).
pub fn device_db_path_for_root(device_root: &Path) -> PathBuf {
    device_db_path(device_root.parent().unwrap_or(device_root))
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
