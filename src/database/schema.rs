use rusqlite::{Connection, Result};

/// Initialize the capture store schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // WAL is not available for in-memory databases; the pragma then reports "memory"
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_schema_v1(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Create schema version 1
fn create_schema_v1(conn: &Connection) -> Result<()> {
    // Table: images - metadata of captured photos, never the bytes
    conn.execute(
        "CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            protocol_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            media_type TEXT NOT NULL,
            upload_status TEXT NOT NULL DEFAULT 'pending' CHECK(upload_status IN ('pending', 'uploading', 'completed', 'failed')),
            url TEXT,
            pdf_url TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            created_at INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_images_protocol ON images(protocol_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_images_status ON images(upload_status)",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_images_timestamp
         AFTER UPDATE ON images
         BEGIN
            UPDATE images SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
         END",
        [],
    )?;

    // Table: drafts - one in-progress capture session per protocol
    conn.execute(
        "CREATE TABLE IF NOT EXISTS drafts (
            protocol_id TEXT PRIMARY KEY,
            form_data TEXT NOT NULL DEFAULT '{}',
            image_ids TEXT NOT NULL DEFAULT '[]',
            uploaded_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            CHECK(uploaded_count >= 0 AND uploaded_count <= total_count)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_drafts_modified ON drafts(last_modified)",
        [],
    )?;

    // Table: queue - uploads waiting for a background retry
    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue (
            id TEXT PRIMARY KEY,
            image_id TEXT,
            variant TEXT NOT NULL DEFAULT 'gallery' CHECK(variant IN ('gallery', 'pdf')),
            blob_ref TEXT NOT NULL,
            filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            record_type TEXT NOT NULL,
            protocol_id TEXT NOT NULL,
            protocol_type TEXT NOT NULL,
            media_type TEXT NOT NULL,
            auth_context TEXT,
            retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_attempt INTEGER,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_protocol ON queue(protocol_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_retries ON queue(retries)",
        [],
    )?;

    // Table: session - heartbeat, shutdown marker, stored auth token
    conn.execute(
        "CREATE TABLE IF NOT EXISTS session (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}
