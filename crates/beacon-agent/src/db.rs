use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::info;

fn now_sql() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn dt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

#[derive(Debug, Clone)]
pub struct LocalShareRow {
    pub id: String,
    pub name: String,
    pub root_path: String,
    pub read_only: bool,
}

/// Staging record for one incoming item, keyed `transfer_id:item_id`.
#[derive(Debug, Clone)]
pub struct InboxItemRow {
    pub id: String,
    pub transfer_id: String,
    pub item_id: String,
    pub share_id: String,
    pub filename: String,
    pub expected_size: i64,
    pub expected_sha256: String,
    pub received_size: i64,
    pub part_path: String,
    pub inbox_path: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxItemRow {
    pub fn composite_id(transfer_id: &str, item_id: &str) -> String {
        format!("{transfer_id}:{item_id}")
    }
}

const INBOX_COLUMNS: &str = "id, transfer_id, item_id, share_id, filename, expected_size, \
     expected_sha256, received_size, part_path, inbox_path, state, created_at, updated_at";

fn map_inbox_item(row: &Row<'_>) -> rusqlite::Result<InboxItemRow> {
    Ok(InboxItemRow {
        id: row.get(0)?,
        transfer_id: row.get(1)?,
        item_id: row.get(2)?,
        share_id: row.get(3)?,
        filename: row.get(4)?,
        expected_size: row.get(5)?,
        expected_sha256: row.get(6)?,
        received_size: row.get(7)?,
        part_path: row.get(8)?,
        inbox_path: row.get(9)?,
        state: row.get(10)?,
        created_at: dt_col(row, 11)?,
        updated_at: dt_col(row, 12)?,
    })
}

/// Agent-local state store: exposed shares and the chunked-inbox staging
/// records. Same single-connection discipline as the coordinator store.
pub struct AgentDb {
    conn: Mutex<Connection>,
}

impl AgentDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Self::migrate(&conn)?;
        info!("Agent state database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS local_shares (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                root_path   TEXT NOT NULL,
                read_only   INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbox_transfer_items (
                id              TEXT PRIMARY KEY,
                transfer_id     TEXT NOT NULL,
                item_id         TEXT NOT NULL,
                share_id        TEXT NOT NULL,
                filename        TEXT NOT NULL,
                expected_size   INTEGER NOT NULL,
                expected_sha256 TEXT NOT NULL,
                received_size   INTEGER NOT NULL DEFAULT 0,
                part_path       TEXT NOT NULL,
                inbox_path      TEXT,
                state           TEXT NOT NULL DEFAULT 'pending',
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_inbox_items_transfer
                ON inbox_transfer_items(transfer_id);
            CREATE INDEX IF NOT EXISTS idx_inbox_items_item
                ON inbox_transfer_items(item_id);
            ",
        )?;
        Ok(())
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    // -- Shares --

    pub fn upsert_local_share(
        &self,
        id: &str,
        name: &str,
        root_path: &str,
        read_only: bool,
    ) -> Result<()> {
        let stamp = now_sql();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO local_shares (id, name, root_path, read_only, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     root_path = excluded.root_path,
                     read_only = excluded.read_only,
                     updated_at = excluded.updated_at",
                rusqlite::params![id, name, root_path, read_only, stamp],
            )?;
            Ok(())
        })
    }

    pub fn get_local_share(&self, id: &str) -> Result<Option<LocalShareRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, root_path, read_only FROM local_shares WHERE id = ?1",
                [id],
                |row| {
                    Ok(LocalShareRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        root_path: row.get(2)?,
                        read_only: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_local_shares(&self) -> Result<Vec<LocalShareRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, root_path, read_only FROM local_shares")?;
            let rows = stmt.query_map([], |row| {
                Ok(LocalShareRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    root_path: row.get(2)?,
                    read_only: row.get(3)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    // -- Inbox items --

    pub fn get_inbox_item(&self, id: &str) -> Result<Option<InboxItemRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {INBOX_COLUMNS} FROM inbox_transfer_items WHERE id = ?1"),
                [id],
                map_inbox_item,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn insert_inbox_item(&self, item: &InboxItemRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO inbox_transfer_items ({INBOX_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                rusqlite::params![
                    item.id,
                    item.transfer_id,
                    item.item_id,
                    item.share_id,
                    item.filename,
                    item.expected_size,
                    item.expected_sha256,
                    item.received_size,
                    item.part_path,
                    item.inbox_path,
                    item.state,
                    item.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    item.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_inbox_progress(&self, id: &str, received_size: i64, state: &str) -> Result<()> {
        let stamp = now_sql();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE inbox_transfer_items
                 SET received_size = ?1, state = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![received_size, state, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn set_inbox_state(&self, id: &str, state: &str) -> Result<()> {
        let stamp = now_sql();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE inbox_transfer_items SET state = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![state, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn set_inbox_destination(&self, id: &str, inbox_path: &str, state: &str) -> Result<()> {
        let stamp = now_sql();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE inbox_transfer_items
                 SET inbox_path = ?1, state = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![inbox_path, state, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn list_inbox_items(&self, transfer_id: &str, share_id: &str) -> Result<Vec<InboxItemRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INBOX_COLUMNS} FROM inbox_transfer_items
                 WHERE transfer_id = ?1 AND share_id = ?2 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([transfer_id, share_id], map_inbox_item)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(transfer_id: &str, item_id: &str) -> InboxItemRow {
        let stamp = Utc::now();
        InboxItemRow {
            id: InboxItemRow::composite_id(transfer_id, item_id),
            transfer_id: transfer_id.into(),
            item_id: item_id.into(),
            share_id: "s-1".into(),
            filename: "payload.bin".into(),
            expected_size: 1024,
            expected_sha256: "0".repeat(64),
            received_size: 0,
            part_path: "/tmp/part".into(),
            inbox_path: None,
            state: "pending".into(),
            created_at: stamp,
            updated_at: stamp,
        }
    }

    #[test]
    fn inbox_item_round_trip() {
        let db = AgentDb::open_in_memory().unwrap();
        db.insert_inbox_item(&sample_item("t-1", "i-1")).unwrap();

        let loaded = db.get_inbox_item("t-1:i-1").unwrap().unwrap();
        assert_eq!(loaded.filename, "payload.bin");
        assert_eq!(loaded.state, "pending");

        db.update_inbox_progress("t-1:i-1", 512, "receiving").unwrap();
        let loaded = db.get_inbox_item("t-1:i-1").unwrap().unwrap();
        assert_eq!(loaded.received_size, 512);
        assert_eq!(loaded.state, "receiving");

        db.set_inbox_destination("t-1:i-1", "/inbox/committed/payload.bin", "committed")
            .unwrap();
        let loaded = db.get_inbox_item("t-1:i-1").unwrap().unwrap();
        assert_eq!(
            loaded.inbox_path.as_deref(),
            Some("/inbox/committed/payload.bin")
        );
        assert_eq!(loaded.state, "committed");
    }

    #[test]
    fn listing_is_scoped_to_transfer_and_share() {
        let db = AgentDb::open_in_memory().unwrap();
        db.insert_inbox_item(&sample_item("t-1", "i-1")).unwrap();
        db.insert_inbox_item(&sample_item("t-1", "i-2")).unwrap();
        db.insert_inbox_item(&sample_item("t-2", "i-3")).unwrap();

        assert_eq!(db.list_inbox_items("t-1", "s-1").unwrap().len(), 2);
        assert_eq!(db.list_inbox_items("t-2", "s-1").unwrap().len(), 1);
        assert!(db.list_inbox_items("t-1", "other").unwrap().is_empty());
    }

    #[test]
    fn local_share_upsert_overwrites() {
        let db = AgentDb::open_in_memory().unwrap();
        db.upsert_local_share("s-1", "Home", "/srv/home", false).unwrap();
        db.upsert_local_share("s-1", "Home", "/srv/home", true).unwrap();
        let share = db.get_local_share("s-1").unwrap().unwrap();
        assert!(share.read_only);
        assert_eq!(db.list_local_shares().unwrap().len(), 1);
    }
}
