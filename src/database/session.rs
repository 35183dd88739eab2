use super::guard::ensure_metadata;
use super::{now_ms, DurableStore, StoreResult};
use rusqlite::{params, OptionalExtension};

impl DurableStore {
    pub async fn get_session_value(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM session WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn set_session_value(&self, key: &str, value: &str) -> StoreResult<()> {
        ensure_metadata(key, value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_session_value(&self, key: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM session WHERE key = ?1", [key])?;
            Ok(())
        })
        .await
    }
}
