// 💾 Receipt Store - Per-user artifacts + SQLite ledger
//
// <user root>/
//   ledger.db                                  index + audit trail
//   <extraction>/<file-name>-<sha256>/
//     original-image.<ext>                     upload as received
//     edited-image.jpg                         what the model saw
//     receipt-<uuid>.json                      one per submission
//     draft.json                               unconfirmed candidate
//
// Append-only: submissions are never updated or deleted.

use crate::config::DataSettings;
use crate::intake::{NormalizedImage, JPEG_MEDIA_TYPE};
use crate::receipt::Receipt;
use anyhow::{bail, Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = "ledger.db";
pub const EDITED_IMAGE: &str = "edited-image.jpg";
pub const DRAFT_FILE: &str = "draft.json";
/// Artifact directory for receipts entered without a photo
pub const MANUAL_DIR: &str = "manual";

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReceipt {
    pub receipt_uuid: String,
    pub username: String,
    pub image_sha256: Option<String>,
    pub source_file: Option<String>,
    pub artifact_dir: PathBuf,
    pub persisted_at: DateTime<Utc>,
    pub receipt: Receipt,
}

impl StoredReceipt {
    pub fn record_path(&self) -> PathBuf {
        self.artifact_dir.join(format!("receipt-{}.json", self.receipt_uuid))
    }
}

/// Audit trail entry
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Candidate saved for later review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub source_file: Option<String>,
    pub image_sha256: Option<String>,
    pub saved_at: DateTime<Utc>,
    pub candidate: serde_json::Value,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt_uuid TEXT UNIQUE NOT NULL,
            username TEXT NOT NULL,
            image_sha256 TEXT,
            source_file TEXT,
            artifact_dir TEXT NOT NULL,
            shop_name TEXT NOT NULL,
            date_str TEXT NOT NULL,
            time_str TEXT NOT NULL,
            total REAL NOT NULL,
            item_count INTEGER NOT NULL,
            persisted_at TEXT NOT NULL,
            record TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt_uuid TEXT NOT NULL REFERENCES receipts(receipt_uuid),
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            count INTEGER,
            mass REAL,
            tax TEXT,
            category TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_receipts_image ON receipts(image_sha256)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_items_receipt ON items(receipt_uuid)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// User names become directory names
pub fn validate_username(username: &str) -> Result<()> {
    let valid = !username.is_empty()
        && !username.starts_with('.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if !valid {
        bail!(
            "Invalid user name {:?}: use letters, digits, '.', '_' or '-', not starting with '.'",
            username
        );
    }
    Ok(())
}

fn json_column(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// RECEIPT STORE
// ============================================================================

pub struct ReceiptStore {
    username: String,
    extraction_dir: PathBuf,
    collation_dir: PathBuf,
    conn: Connection,
}

impl ReceiptStore {
    pub fn open(data: &DataSettings, username: &str) -> Result<Self> {
        validate_username(username)?;

        let root = data.user_root(username);
        let extraction_dir = data.extraction_dir(username);
        fs::create_dir_all(&extraction_dir).with_context(|| {
            format!("Failed to create extraction directory: {}", extraction_dir.display())
        })?;

        let ledger = root.join(LEDGER_FILE);
        let conn = Connection::open(&ledger)
            .with_context(|| format!("Failed to open ledger: {}", ledger.display()))?;
        setup_database(&conn)?;

        tracing::debug!(user = username, root = %root.display(), "opened receipt store");

        Ok(ReceiptStore {
            username: username.to_string(),
            extraction_dir,
            collation_dir: data.collation_dir(username),
            conn,
        })
    }

    /// Store rooted at `root` with default subdirectories
    pub fn open_in(root: &Path, username: &str) -> Result<Self> {
        let data = DataSettings {
            root_dir: root.to_path_buf(),
            ..DataSettings::default()
        };
        Self::open(&data, username)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn extraction_dir(&self) -> &Path {
        &self.extraction_dir
    }

    pub fn collation_dir(&self) -> &Path {
        &self.collation_dir
    }

    fn artifact_dir(&self, image: Option<&NormalizedImage>) -> PathBuf {
        match image {
            Some(image) => self.extraction_dir.join(image.artifact_key()),
            None => self.extraction_dir.join(MANUAL_DIR),
        }
    }

    /// Write the upload and the edited image once per distinct upload
    fn save_images(&self, dir: &Path, image: &NormalizedImage) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;

        let ext = match image::guess_format(&image.original) {
            Ok(image::ImageFormat::Png) => "png",
            _ => "jpg",
        };
        let original = dir.join(format!("original-image.{}", ext));
        if !original.exists() {
            fs::write(&original, &image.original)
                .with_context(|| format!("Failed to write {}", original.display()))?;
        }

        let edited = dir.join(EDITED_IMAGE);
        if !edited.exists() {
            fs::write(&edited, &image.bytes)
                .with_context(|| format!("Failed to write {}", edited.display()))?;
        }

        Ok(())
    }

    /// Append a confirmed receipt. Never overwrites an earlier submission.
    pub fn persist(&self, receipt: &Receipt, image: Option<&NormalizedImage>) -> Result<StoredReceipt> {
        let dir = self.artifact_dir(image);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;
        if let Some(image) = image {
            self.save_images(&dir, image)?;
        }

        let stored = StoredReceipt {
            receipt_uuid: uuid::Uuid::new_v4().to_string(),
            username: self.username.clone(),
            image_sha256: image.map(|i| i.original_sha256.clone()),
            source_file: image.map(|i| i.source_name.clone()),
            artifact_dir: dir,
            persisted_at: Utc::now(),
            receipt: receipt.clone(),
        };

        let record = serde_json::to_string_pretty(receipt)?;
        let path = stored.record_path();

        // Record file and ledger row land together or not at all
        let tx = self.conn.unchecked_transaction()?;
        self.index(&tx, &stored, &record)?;
        write_record(&path, &record)?;
        if let Err(e) = tx.commit() {
            if let Err(rm) = fs::remove_file(&path) {
                tracing::error!(path = %path.display(), error = %rm, "failed to remove unindexed record");
            }
            return Err(e).context("Failed to commit receipt to ledger");
        }

        tracing::info!(
            receipt = %stored.receipt_uuid,
            user = %self.username,
            items = receipt.items.len(),
            path = %path.display(),
            "persisted receipt"
        );

        Ok(stored)
    }

    fn index(&self, tx: &rusqlite::Transaction<'_>, stored: &StoredReceipt, record: &str) -> Result<()> {
        let receipt = &stored.receipt;

        tx.execute(
            "INSERT INTO receipts (
                receipt_uuid, username, image_sha256, source_file, artifact_dir,
                shop_name, date_str, time_str, total, item_count, persisted_at, record
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                stored.receipt_uuid,
                stored.username,
                stored.image_sha256,
                stored.source_file,
                stored.artifact_dir.to_string_lossy(),
                receipt.shop.name,
                receipt.shop.date_str,
                receipt.shop.time_str,
                receipt.shop.total,
                receipt.items.len() as i64,
                stored.persisted_at.to_rfc3339(),
                record,
            ],
        )?;

        for (position, item) in receipt.items.iter().enumerate() {
            tx.execute(
                "INSERT INTO items (receipt_uuid, position, name, price, count, mass, tax, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stored.receipt_uuid,
                    position as i64,
                    item.name,
                    item.price,
                    item.count,
                    item.mass,
                    item.tax,
                    item.category.map(|c| c.label()),
                ],
            )?;
        }

        insert_event(
            tx,
            &Event::new(
                "receipt_persisted",
                "receipt",
                &stored.receipt_uuid,
                serde_json::json!({
                    "shop": receipt.shop.name,
                    "total": receipt.shop.total,
                    "items": receipt.items.len(),
                    "image_sha256": stored.image_sha256,
                }),
                &self.username,
            ),
        )?;

        Ok(())
    }

    // ========================================================================
    // DRAFTS
    // ========================================================================

    /// Save an unconfirmed candidate next to its images; replaces an older draft
    pub fn save_draft(&self, candidate: &serde_json::Value, image: Option<&NormalizedImage>) -> Result<PathBuf> {
        let dir = self.artifact_dir(image);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;
        if let Some(image) = image {
            self.save_images(&dir, image)?;
        }

        let draft = Draft {
            source_file: image.map(|i| i.source_name.clone()),
            image_sha256: image.map(|i| i.original_sha256.clone()),
            saved_at: Utc::now(),
            candidate: candidate.clone(),
        };
        let path = dir.join(DRAFT_FILE);
        fs::write(&path, serde_json::to_string_pretty(&draft)?)
            .with_context(|| format!("Failed to write draft: {}", path.display()))?;

        insert_event(
            &self.conn,
            &Event::new(
                "draft_saved",
                "image",
                draft.image_sha256.as_deref().unwrap_or(MANUAL_DIR),
                serde_json::json!({ "path": path.to_string_lossy() }),
                &self.username,
            ),
        )?;

        Ok(path)
    }

    /// Load a draft and, when its images are present, the image it came from
    pub fn load_draft(path: &Path) -> Result<(Draft, Option<NormalizedImage>)> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read draft: {}", path.display()))?;
        let draft: Draft = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse draft: {}", path.display()))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let image = match (&draft.source_file, &draft.image_sha256) {
            (Some(source), Some(sha)) => load_image(dir, source, sha)?,
            _ => None,
        };

        Ok((draft, image))
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    fn query(&self, filter: &str, value: Option<&str>) -> Result<Vec<StoredReceipt>> {
        let sql = format!(
            "SELECT receipt_uuid, username, image_sha256, source_file, artifact_dir, persisted_at, record
             FROM receipts {} ORDER BY id ASC",
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let rows = match value {
            Some(v) => stmt
                .query_map(params![v], receipt_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], receipt_from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// All persisted receipts, oldest first
    pub fn list(&self) -> Result<Vec<StoredReceipt>> {
        self.query("", None)
    }

    pub fn get(&self, receipt_uuid: &str) -> Result<Option<StoredReceipt>> {
        Ok(self
            .query("WHERE receipt_uuid = ?1", Some(receipt_uuid))?
            .into_iter()
            .next())
    }

    /// Earlier submissions of the same upload
    pub fn records_for_image(&self, image_sha256: &str) -> Result<Vec<StoredReceipt>> {
        self.query("WHERE image_sha256 = ?1", Some(image_sha256))
    }

    pub fn count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM receipts", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn item_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn latest_persisted_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT MAX(persisted_at) FROM receipts", [], |row| row.get(0))
            .optional()?
            .flatten();
        raw.map(|r| time_column(0, &r).map_err(anyhow::Error::from))
            .transpose()
    }

    pub fn events_for(&self, entity_id: &str) -> Result<Vec<Event>> {
        get_events_for_entity(&self.conn, entity_id)
    }

    pub fn record_event(&self, event: &Event) -> Result<()> {
        insert_event(&self.conn, event)
    }
}

fn write_record(path: &Path, record: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create record file: {}", path.display()))?;
    file.write_all(record.as_bytes())
        .with_context(|| format!("Failed to write record file: {}", path.display()))
}

fn receipt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredReceipt> {
    let artifact_dir: String = row.get(4)?;
    let persisted_at: String = row.get(5)?;
    let record: String = row.get(6)?;
    let receipt = serde_json::from_value(json_column(6, &record)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(StoredReceipt {
        receipt_uuid: row.get(0)?,
        username: row.get(1)?,
        image_sha256: row.get(2)?,
        source_file: row.get(3)?,
        artifact_dir: PathBuf::from(artifact_dir),
        persisted_at: time_column(5, &persisted_at)?,
        receipt,
    })
}

fn load_image(dir: &Path, source: &str, sha: &str) -> Result<Option<NormalizedImage>> {
    let edited_path = dir.join(EDITED_IMAGE);
    let original_path = ["original-image.jpg", "original-image.png"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists());

    let original_path = match original_path {
        Some(p) if edited_path.exists() => p,
        _ => return Ok(None),
    };

    let original = fs::read(&original_path)
        .with_context(|| format!("Failed to read {}", original_path.display()))?;
    let bytes = fs::read(&edited_path)
        .with_context(|| format!("Failed to read {}", edited_path.display()))?;
    let (width, height) = image::load_from_memory(&bytes)
        .map(|img| (img.width(), img.height()))
        .with_context(|| format!("Failed to decode {}", edited_path.display()))?;

    Ok(Some(NormalizedImage {
        source_name: source.to_string(),
        original,
        original_sha256: sha.to_string(),
        bytes,
        media_type: JPEG_MEDIA_TYPE,
        width,
        height,
    }))
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

pub fn get_events_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_id = ?1
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_id], |row| {
            let timestamp: String = row.get(1)?;
            let data: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: time_column(1, &timestamp)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: json_column(5, &data)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// TESTS
// ============================================================================
