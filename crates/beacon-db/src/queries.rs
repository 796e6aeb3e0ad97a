use crate::Database;
use crate::models::{
    AgentDeviceRow, ClientDeviceRow, PairingSessionRow, PasscodeWindowRow, PrincipalRow, ShareRow,
    TransferItemRow, TransferRow, dt_col, dt_to_sql, new_id, now, opt_dt_col,
};
use anyhow::Result;
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row};

/// Transfer states from which no further transitions are permitted.
pub const TERMINAL_TRANSFER_STATES: &[&str] =
    &["completed", "rejected", "expired", "failed", "cancelled"];

/// Item states that bulk cancellation must not overwrite.
const SETTLED_ITEM_STATES: &[&str] = &[
    "finalized",
    "completed",
    "rejected",
    "failed",
    "cancelled",
    "expired",
];

pub fn is_terminal_transfer_state(state: &str) -> bool {
    TERMINAL_TRANSFER_STATES.contains(&state)
}

fn quoted_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|value| format!("'{}'", value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_principal(row: &Row<'_>) -> rusqlite::Result<PrincipalRow> {
    Ok(PrincipalRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        public_key: row.get(2)?,
        status: row.get(3)?,
        created_at: dt_col(row, 4)?,
        updated_at: dt_col(row, 5)?,
    })
}

fn map_client_device(row: &Row<'_>) -> rusqlite::Result<ClientDeviceRow> {
    Ok(ClientDeviceRow {
        id: row.get(0)?,
        principal_id: row.get(1)?,
        name: row.get(2)?,
        platform: row.get(3)?,
        public_key: row.get(4)?,
        device_secret_hash: row.get(5)?,
        status: row.get(6)?,
        last_seen: opt_dt_col(row, 7)?,
        created_at: dt_col(row, 8)?,
        updated_at: dt_col(row, 9)?,
    })
}

fn map_pairing_session(row: &Row<'_>) -> rusqlite::Result<PairingSessionRow> {
    Ok(PairingSessionRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        device_name: row.get(2)?,
        platform: row.get(3)?,
        public_key: row.get(4)?,
        pairing_code: row.get(5)?,
        status: row.get(6)?,
        expires_at: dt_col(row, 7)?,
        approved_by_principal_id: row.get(8)?,
        created_at: dt_col(row, 9)?,
    })
}

fn map_agent_device(row: &Row<'_>) -> rusqlite::Result<AgentDeviceRow> {
    Ok(AgentDeviceRow {
        id: row.get(0)?,
        owner_principal_id: row.get(1)?,
        name: row.get(2)?,
        base_url: row.get(3)?,
        visibility: row.get(4)?,
        online_state: row.get(5)?,
        last_seen: opt_dt_col(row, 6)?,
        created_at: dt_col(row, 7)?,
        updated_at: dt_col(row, 8)?,
    })
}

const AGENT_DEVICE_COLUMNS: &str = "id, owner_principal_id, name, base_url, visibility, \
     online_state, last_seen, created_at, updated_at";

fn map_share(row: &Row<'_>) -> rusqlite::Result<ShareRow> {
    Ok(ShareRow {
        id: row.get(0)?,
        agent_device_id: row.get(1)?,
        name: row.get(2)?,
        root_path: row.get(3)?,
        read_only: row.get(4)?,
        created_at: dt_col(row, 5)?,
        updated_at: dt_col(row, 6)?,
    })
}

const SHARE_COLUMNS: &str = "id, agent_device_id, name, root_path, read_only, created_at, updated_at";

fn map_transfer(row: &Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: row.get(0)?,
        sender_principal_id: row.get(1)?,
        sender_client_device_id: row.get(2)?,
        receiver_device_id: row.get(3)?,
        receiver_share_id: row.get(4)?,
        state: row.get(5)?,
        reason: row.get(6)?,
        created_at: dt_col(row, 7)?,
        expires_at: dt_col(row, 8)?,
        updated_at: dt_col(row, 9)?,
    })
}

const TRANSFER_COLUMNS: &str = "id, sender_principal_id, sender_client_device_id, \
     receiver_device_id, receiver_share_id, state, reason, created_at, expires_at, updated_at";

fn map_transfer_item(row: &Row<'_>) -> rusqlite::Result<TransferItemRow> {
    Ok(TransferItemRow {
        id: row.get(0)?,
        transfer_request_id: row.get(1)?,
        filename: row.get(2)?,
        size: row.get(3)?,
        sha256: row.get(4)?,
        mime_type: row.get(5)?,
        state: row.get(6)?,
        created_at: dt_col(row, 7)?,
        updated_at: dt_col(row, 8)?,
    })
}

const TRANSFER_ITEM_COLUMNS: &str =
    "id, transfer_request_id, filename, size, sha256, mime_type, state, created_at, updated_at";

fn map_passcode_window(row: &Row<'_>) -> rusqlite::Result<PasscodeWindowRow> {
    Ok(PasscodeWindowRow {
        id: row.get(0)?,
        transfer_request_id: row.get(1)?,
        passcode_hash: row.get(2)?,
        attempts_left: row.get(3)?,
        failure_count: row.get(4)?,
        locked_until: opt_dt_col(row, 5)?,
        expires_at: dt_col(row, 6)?,
        opened_at: opt_dt_col(row, 7)?,
        opened_by_principal_id: row.get(8)?,
        created_at: dt_col(row, 9)?,
        updated_at: dt_col(row, 10)?,
    })
}

const PASSCODE_WINDOW_COLUMNS: &str = "id, transfer_request_id, passcode_hash, attempts_left, \
     failure_count, locked_until, expires_at, opened_at, opened_by_principal_id, created_at, updated_at";

impl Database {
    // -- Principals --

    pub fn create_principal(
        &self,
        id: &str,
        display_name: &str,
        public_key: Option<&str>,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO principals (id, display_name, public_key, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
                rusqlite::params![id, display_name, public_key, stamp],
            )?;
            Ok(())
        })
    }

    pub fn get_principal(&self, id: &str) -> Result<Option<PrincipalRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, public_key, status, created_at, updated_at
                 FROM principals WHERE id = ?1",
                [id],
                map_principal,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn any_principal_exists(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM principals", [], |r| r.get(0))?;
            Ok(count > 0)
        })
    }

    pub fn list_active_principal_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM principals WHERE status = 'active'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    // -- Client devices --

    #[allow(clippy::too_many_arguments)]
    pub fn create_client_device(
        &self,
        id: &str,
        principal_id: &str,
        name: &str,
        platform: &str,
        public_key: Option<&str>,
        device_secret_hash: &str,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO client_devices
                     (id, principal_id, name, platform, public_key, device_secret_hash,
                      status, last_seen, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?7, ?7)",
                rusqlite::params![id, principal_id, name, platform, public_key, device_secret_hash, stamp],
            )?;
            Ok(())
        })
    }

    pub fn get_client_device(&self, id: &str) -> Result<Option<ClientDeviceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, principal_id, name, platform, public_key, device_secret_hash,
                        status, last_seen, created_at, updated_at
                 FROM client_devices WHERE id = ?1",
                [id],
                map_client_device,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn touch_client_device(&self, id: &str) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE client_devices SET last_seen = ?1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![stamp, id],
            )?;
            Ok(())
        })
    }

    // -- Pairing sessions --

    pub fn create_pairing_session(
        &self,
        id: &str,
        display_name: &str,
        device_name: &str,
        platform: &str,
        public_key: Option<&str>,
        pairing_code: &str,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        let expires = dt_to_sql(expires_at);
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO pairing_sessions
                     (id, display_name, device_name, platform, public_key, pairing_code,
                      status, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
                rusqlite::params![id, display_name, device_name, platform, public_key, pairing_code, expires, stamp],
            )?;
            Ok(())
        })
    }

    pub fn get_pairing_session(&self, id: &str) -> Result<Option<PairingSessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, device_name, platform, public_key, pairing_code,
                        status, expires_at, approved_by_principal_id, created_at
                 FROM pairing_sessions WHERE id = ?1",
                [id],
                map_pairing_session,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn mark_pairing_session(
        &self,
        id: &str,
        status: &str,
        approved_by_principal_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE pairing_sessions SET status = ?1, approved_by_principal_id = ?2 WHERE id = ?3",
                rusqlite::params![status, approved_by_principal_id, id],
            )?;
            Ok(())
        })
    }

    // -- Agent devices --

    pub fn get_agent_device(&self, id: &str) -> Result<Option<AgentDeviceRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_DEVICE_COLUMNS} FROM agent_devices WHERE id = ?1"),
                [id],
                map_agent_device,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_agent_devices(&self) -> Result<Vec<AgentDeviceRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGENT_DEVICE_COLUMNS} FROM agent_devices ORDER BY name ASC"
            ))?;
            let rows = stmt.query_map([], map_agent_device)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn list_owned_device_ids(&self, principal_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM agent_devices WHERE owner_principal_id = ?1")?;
            let rows = stmt.query_map([principal_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn insert_agent_device(
        &self,
        id: &str,
        owner_principal_id: &str,
        name: &str,
        base_url: &str,
        visible: bool,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO agent_devices
                     (id, owner_principal_id, name, base_url, visibility, online_state,
                      last_seen, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6, ?6)",
                rusqlite::params![id, owner_principal_id, name, base_url, visible, stamp],
            )?;
            Ok(())
        })
    }

    pub fn update_agent_registration(
        &self,
        id: &str,
        owner_principal_id: &str,
        name: &str,
        base_url: &str,
        visible: bool,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE agent_devices
                 SET owner_principal_id = ?1, name = ?2, base_url = ?3, visibility = ?4,
                     online_state = 1, last_seen = ?5, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![owner_principal_id, name, base_url, visible, stamp, id],
            )?;
            Ok(())
        })
    }

    /// Returns false if the device is unknown.
    pub fn heartbeat_agent_device(&self, id: &str, online: bool) -> Result<bool> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE agent_devices SET last_seen = ?1, online_state = ?2, updated_at = ?1
                 WHERE id = ?3",
                rusqlite::params![stamp, online, id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn set_device_visibility(&self, id: &str, visible: bool) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE agent_devices SET visibility = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![visible, stamp, id],
            )?;
            Ok(())
        })
    }

    // -- Shares --

    pub fn get_share(&self, id: &str) -> Result<Option<ShareRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SHARE_COLUMNS} FROM shares WHERE id = ?1"),
                [id],
                map_share,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn insert_share(
        &self,
        id: &str,
        agent_device_id: &str,
        name: &str,
        root_path: &str,
        read_only: bool,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO shares (id, agent_device_id, name, root_path, read_only, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![id, agent_device_id, name, root_path, read_only, stamp],
            )?;
            Ok(())
        })
    }

    pub fn update_share(&self, id: &str, name: &str, root_path: &str, read_only: bool) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE shares SET name = ?1, root_path = ?2, read_only = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![name, root_path, read_only, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn list_device_shares(&self, agent_device_id: &str) -> Result<Vec<ShareRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SHARE_COLUMNS} FROM shares WHERE agent_device_id = ?1"
            ))?;
            let rows = stmt.query_map([agent_device_id], map_share)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    /// Shares joined with their hosting device, sorted by share name.
    pub fn list_shares_with_devices(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<(ShareRow, AgentDeviceRow)>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT s.id, s.agent_device_id, s.name, s.root_path, s.read_only,
                        s.created_at, s.updated_at,
                        d.id, d.owner_principal_id, d.name, d.base_url, d.visibility,
                        d.online_state, d.last_seen, d.created_at, d.updated_at
                 FROM shares s
                 JOIN agent_devices d ON s.agent_device_id = d.id
                 {} ORDER BY s.name ASC",
                if device_id.is_some() {
                    "WHERE s.agent_device_id = ?1"
                } else {
                    ""
                }
            );
            let map_pair = |row: &Row<'_>| -> rusqlite::Result<(ShareRow, AgentDeviceRow)> {
                let share = ShareRow {
                    id: row.get(0)?,
                    agent_device_id: row.get(1)?,
                    name: row.get(2)?,
                    root_path: row.get(3)?,
                    read_only: row.get(4)?,
                    created_at: dt_col(row, 5)?,
                    updated_at: dt_col(row, 6)?,
                };
                let device = AgentDeviceRow {
                    id: row.get(7)?,
                    owner_principal_id: row.get(8)?,
                    name: row.get(9)?,
                    base_url: row.get(10)?,
                    visibility: row.get(11)?,
                    online_state: row.get(12)?,
                    last_seen: opt_dt_col(row, 13)?,
                    created_at: dt_col(row, 14)?,
                    updated_at: dt_col(row, 15)?,
                };
                Ok((share, device))
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = match device_id {
                Some(id) => stmt.query_map([id], map_pair)?,
                None => stmt.query_map([], map_pair)?,
            };
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    // -- ACL grants --

    pub fn get_grant_raw(&self, principal_id: &str, share_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT permissions_raw FROM acl_grants WHERE principal_id = ?1 AND share_id = ?2",
                [principal_id, share_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Batched grant lookup for one principal over many shares.
    pub fn get_grants_raw_for_shares(
        &self,
        principal_id: &str,
        share_ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        if share_ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT share_id, permissions_raw FROM acl_grants
                 WHERE principal_id = ?1 AND share_id IN ({})",
                (2..=share_ids.len() + 1)
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<&dyn ToSql> = vec![&principal_id];
            for share_id in share_ids {
                params.push(share_id);
            }
            let rows = stmt.query_map(params.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn upsert_grant(&self, principal_id: &str, share_id: &str, permissions_raw: &str) -> Result<()> {
        let stamp = dt_to_sql(now());
        let id = new_id();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO acl_grants (id, principal_id, share_id, permissions_raw, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(principal_id, share_id)
                 DO UPDATE SET permissions_raw = excluded.permissions_raw, updated_at = excluded.updated_at",
                rusqlite::params![id, principal_id, share_id, permissions_raw, stamp],
            )?;
            Ok(())
        })
    }

    pub fn insert_grant_if_absent(
        &self,
        principal_id: &str,
        share_id: &str,
        permissions_raw: &str,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        let id = new_id();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO acl_grants (id, principal_id, share_id, permissions_raw, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(principal_id, share_id) DO NOTHING",
                rusqlite::params![id, principal_id, share_id, permissions_raw, stamp],
            )?;
            Ok(())
        })
    }

    pub fn list_grant_principals_for_share(&self, share_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT principal_id FROM acl_grants WHERE share_id = ?1")?;
            let rows = stmt.query_map([share_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn list_grant_share_ids_for_principal(&self, principal_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT share_id FROM acl_grants WHERE principal_id = ?1")?;
            let rows = stmt.query_map([principal_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    /// All shares joined with the owning principal of their device.
    pub fn list_shares_with_owner(&self) -> Result<Vec<(ShareRow, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.agent_device_id, s.name, s.root_path, s.read_only,
                        s.created_at, s.updated_at, d.owner_principal_id
                 FROM shares s JOIN agent_devices d ON s.agent_device_id = d.id",
            )?;
            let rows = stmt.query_map([], |row| {
                let share = map_share(row)?;
                let owner: String = row.get(7)?;
                Ok((share, owner))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    // -- Transfers --

    pub fn insert_transfer(&self, transfer: &TransferRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO transfer_requests ({TRANSFER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                rusqlite::params![
                    transfer.id,
                    transfer.sender_principal_id,
                    transfer.sender_client_device_id,
                    transfer.receiver_device_id,
                    transfer.receiver_share_id,
                    transfer.state,
                    transfer.reason,
                    dt_to_sql(transfer.created_at),
                    dt_to_sql(transfer.expires_at),
                    dt_to_sql(transfer.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_transfer_item(&self, item: &TransferItemRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO transfer_items ({TRANSFER_ITEM_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                rusqlite::params![
                    item.id,
                    item.transfer_request_id,
                    item.filename,
                    item.size,
                    item.sha256,
                    item.mime_type,
                    item.state,
                    dt_to_sql(item.created_at),
                    dt_to_sql(item.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_transfer(&self, id: &str) -> Result<Option<TransferRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TRANSFER_COLUMNS} FROM transfer_requests WHERE id = ?1"),
                [id],
                map_transfer,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn get_transfer_items(&self, transfer_id: &str) -> Result<Vec<TransferItemRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRANSFER_ITEM_COLUMNS} FROM transfer_items
                 WHERE transfer_request_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([transfer_id], map_transfer_item)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn get_transfer_item(
        &self,
        transfer_id: &str,
        item_id: &str,
    ) -> Result<Option<TransferItemRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TRANSFER_ITEM_COLUMNS} FROM transfer_items
                     WHERE id = ?1 AND transfer_request_id = ?2"
                ),
                [item_id, transfer_id],
                map_transfer_item,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Transfers visible to the caller, most recent first, capped at 200.
    /// `role` is one of `all`, `incoming`, `outgoing`.
    pub fn list_transfers_for(
        &self,
        principal_id: &str,
        owned_device_ids: &[String],
        role: &str,
    ) -> Result<Vec<TransferRow>> {
        self.with_conn(|conn| {
            let device_clause = if owned_device_ids.is_empty() {
                "1 = 0".to_string()
            } else {
                format!(
                    "receiver_device_id IN ({})",
                    (2..=owned_device_ids.len() + 1)
                        .map(|i| format!("?{}", i))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let filter = match role {
                "incoming" => device_clause,
                "outgoing" => "sender_principal_id = ?1".to_string(),
                _ => format!("(sender_principal_id = ?1 OR {})", device_clause),
            };
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfer_requests
                 WHERE {filter} ORDER BY created_at DESC LIMIT 200"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<&dyn ToSql> = vec![&principal_id];
            for device_id in owned_device_ids {
                params.push(device_id);
            }
            let rows = stmt.query_map(params.as_slice(), map_transfer)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    /// Delete caller-visible terminal transfers; items and passcode windows
    /// go with them via cascade. Returns the number deleted.
    pub fn delete_terminal_transfers_for(
        &self,
        principal_id: &str,
        owned_device_ids: &[String],
    ) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let device_clause = if owned_device_ids.is_empty() {
                "1 = 0".to_string()
            } else {
                format!(
                    "receiver_device_id IN ({})",
                    (2..=owned_device_ids.len() + 1)
                        .map(|i| format!("?{}", i))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let sql = format!(
                "DELETE FROM transfer_requests
                 WHERE state IN ({}) AND (sender_principal_id = ?1 OR {device_clause})",
                quoted_list(TERMINAL_TRANSFER_STATES)
            );
            let mut params: Vec<&dyn ToSql> = vec![&principal_id];
            for device_id in owned_device_ids {
                params.push(device_id);
            }
            let deleted = conn.execute(&sql, params.as_slice())?;
            Ok(deleted)
        })
    }

    /// Caller-visible transfers still in a non-terminal state.
    pub fn list_nonterminal_transfers_for(
        &self,
        principal_id: &str,
        owned_device_ids: &[String],
    ) -> Result<Vec<TransferRow>> {
        self.with_conn(|conn| {
            let device_clause = if owned_device_ids.is_empty() {
                "1 = 0".to_string()
            } else {
                format!(
                    "receiver_device_id IN ({})",
                    (2..=owned_device_ids.len() + 1)
                        .map(|i| format!("?{}", i))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfer_requests
                 WHERE state NOT IN ({}) AND (sender_principal_id = ?1 OR {device_clause})",
                quoted_list(TERMINAL_TRANSFER_STATES)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<&dyn ToSql> = vec![&principal_id];
            for device_id in owned_device_ids {
                params.push(device_id);
            }
            let rows = stmt.query_map(params.as_slice(), map_transfer)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    pub fn set_transfer_state(&self, id: &str, state: &str) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE transfer_requests SET state = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![state, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn set_transfer_state_reason(&self, id: &str, state: &str, reason: Option<&str>) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE transfer_requests SET state = ?1, reason = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![state, reason, stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn set_all_items_state(&self, transfer_id: &str, state: &str) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE transfer_items SET state = ?1, updated_at = ?2 WHERE transfer_request_id = ?3",
                rusqlite::params![state, stamp, transfer_id],
            )?;
            Ok(())
        })
    }

    /// Cancel items that have not already settled.
    pub fn cancel_unsettled_items(&self, transfer_id: &str) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                &format!(
                    "UPDATE transfer_items SET state = 'cancelled', updated_at = ?1
                     WHERE transfer_request_id = ?2 AND state NOT IN ({})",
                    quoted_list(SETTLED_ITEM_STATES)
                ),
                rusqlite::params![stamp, transfer_id],
            )?;
            Ok(())
        })
    }

    /// Returns false if the item does not belong to the transfer.
    pub fn set_item_state(&self, transfer_id: &str, item_id: &str, state: &str) -> Result<bool> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE transfer_items SET state = ?1, updated_at = ?2
                 WHERE id = ?3 AND transfer_request_id = ?4",
                rusqlite::params![state, stamp, item_id, transfer_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn item_state_counts(&self, transfer_id: &str) -> Result<Vec<(String, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state, COUNT(*) FROM transfer_items
                 WHERE transfer_request_id = ?1 GROUP BY state",
            )?;
            let rows = stmt.query_map([transfer_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
    }

    // -- Passcode windows --

    pub fn get_passcode_window(&self, transfer_id: &str) -> Result<Option<PasscodeWindowRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {PASSCODE_WINDOW_COLUMNS} FROM passcode_windows
                     WHERE transfer_request_id = ?1"
                ),
                [transfer_id],
                map_passcode_window,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Set (or overwrite in place) the transfer's passcode window: fresh
    /// counters, no lock, unopened.
    pub fn upsert_passcode_window(
        &self,
        transfer_id: &str,
        passcode_hash: &str,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        let expires = dt_to_sql(expires_at);
        let id = new_id();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO passcode_windows
                     (id, transfer_request_id, passcode_hash, attempts_left, failure_count,
                      locked_until, expires_at, opened_at, opened_by_principal_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 5, 0, NULL, ?4, NULL, NULL, ?5, ?5)
                 ON CONFLICT(transfer_request_id) DO UPDATE SET
                     passcode_hash = excluded.passcode_hash,
                     attempts_left = 5,
                     failure_count = 0,
                     locked_until = NULL,
                     expires_at = excluded.expires_at,
                     opened_at = NULL,
                     opened_by_principal_id = NULL,
                     updated_at = excluded.updated_at",
                rusqlite::params![id, transfer_id, passcode_hash, expires, stamp],
            )?;
            Ok(())
        })
    }

    pub fn save_passcode_window(&self, window: &PasscodeWindowRow) -> Result<()> {
        let stamp = dt_to_sql(now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE passcode_windows
                 SET attempts_left = ?1, failure_count = ?2, locked_until = ?3,
                     opened_at = ?4, opened_by_principal_id = ?5, updated_at = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    window.attempts_left,
                    window.failure_count,
                    window.locked_until.map(dt_to_sql),
                    window.opened_at.map(dt_to_sql),
                    window.opened_by_principal_id,
                    stamp,
                    window.id,
                ],
            )?;
            Ok(())
        })
    }

    // -- Audit --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_audit(
        &self,
        actor_principal_id: Option<&str>,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
        metadata_json: &str,
    ) -> Result<()> {
        let stamp = dt_to_sql(now());
        let id = new_id();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO audit_events
                     (id, actor_principal_id, action, resource_type, resource_id, ip, user_agent, metadata_json, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    actor_principal_id,
                    action,
                    resource_type,
                    resource_id,
                    ip,
                    user_agent,
                    metadata_json,
                    stamp
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::models::{TransferItemRow, TransferRow, now};
    use chrono::Duration;

    fn seed_identities(db: &Database) {
        db.create_principal("p-owner", "Owner", None).unwrap();
        db.create_principal("p-sender", "Sender", None).unwrap();
        db.create_client_device("c-sender", "p-sender", "Laptop", "linux", None, "hash")
            .unwrap();
        db.insert_agent_device("d-1", "p-owner", "Media Box", "http://127.0.0.1:7001", true)
            .unwrap();
        db.insert_share("s-1", "d-1", "Home", "/srv/share", false)
            .unwrap();
    }

    fn seed_transfer(db: &Database, id: &str, state: &str) {
        let stamp = now();
        db.insert_transfer(&TransferRow {
            id: id.into(),
            sender_principal_id: "p-sender".into(),
            sender_client_device_id: "c-sender".into(),
            receiver_device_id: "d-1".into(),
            receiver_share_id: "s-1".into(),
            state: state.into(),
            reason: None,
            created_at: stamp,
            expires_at: stamp + Duration::hours(24),
            updated_at: stamp,
        })
        .unwrap();
        db.insert_transfer_item(&TransferItemRow {
            id: format!("{id}-item"),
            transfer_request_id: id.into(),
            filename: "hello.bin".into(),
            size: 5,
            sha256: "0".repeat(64),
            mime_type: None,
            state: "pending".into(),
            created_at: stamp,
            updated_at: stamp,
        })
        .unwrap();
    }

    #[test]
    fn grant_upsert_is_unique_per_principal_share() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        db.upsert_grant("p-sender", "s-1", "read").unwrap();
        db.upsert_grant("p-sender", "s-1", "download,read").unwrap();
        assert_eq!(
            db.get_grant_raw("p-sender", "s-1").unwrap().as_deref(),
            Some("download,read")
        );

        db.insert_grant_if_absent("p-sender", "s-1", "read").unwrap();
        assert_eq!(
            db.get_grant_raw("p-sender", "s-1").unwrap().as_deref(),
            Some("download,read")
        );
    }

    #[test]
    fn transfer_role_filters() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        seed_transfer(&db, "t-1", "pending_receiver_approval");

        let owned = db.list_owned_device_ids("p-owner").unwrap();
        assert_eq!(owned, vec!["d-1".to_string()]);

        let incoming = db.list_transfers_for("p-owner", &owned, "incoming").unwrap();
        assert_eq!(incoming.len(), 1);
        let outgoing = db.list_transfers_for("p-owner", &owned, "outgoing").unwrap();
        assert!(outgoing.is_empty());
        let sender_all = db.list_transfers_for("p-sender", &[], "all").unwrap();
        assert_eq!(sender_all.len(), 1);
    }

    #[test]
    fn clear_history_only_deletes_terminal() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        seed_transfer(&db, "t-live", "in_progress");
        seed_transfer(&db, "t-done", "completed");

        let owned = db.list_owned_device_ids("p-owner").unwrap();
        let deleted = db.delete_terminal_transfers_for("p-owner", &owned).unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_transfer("t-live").unwrap().is_some());
        assert!(db.get_transfer("t-done").unwrap().is_none());
        // Cascade removed the item rows too.
        assert!(db.get_transfer_items("t-done").unwrap().is_empty());
    }

    #[test]
    fn cancel_skips_settled_items() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        seed_transfer(&db, "t-1", "in_progress");
        db.set_item_state("t-1", "t-1-item", "finalized").unwrap();
        db.cancel_unsettled_items("t-1").unwrap();
        let items = db.get_transfer_items("t-1").unwrap();
        assert_eq!(items[0].state, "finalized");
    }

    #[test]
    fn passcode_window_overwrites_in_place() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        seed_transfer(&db, "t-1", "pending_receiver_approval");

        db.upsert_passcode_window("t-1", "hash-a", now() + Duration::seconds(300))
            .unwrap();
        let first = db.get_passcode_window("t-1").unwrap().unwrap();

        let mut mutated = first.clone();
        mutated.failure_count = 3;
        mutated.attempts_left = 2;
        db.save_passcode_window(&mutated).unwrap();

        db.upsert_passcode_window("t-1", "hash-b", now() + Duration::seconds(300))
            .unwrap();
        let second = db.get_passcode_window("t-1").unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.passcode_hash, "hash-b");
        assert_eq!(second.attempts_left, 5);
        assert_eq!(second.failure_count, 0);
        assert!(second.locked_until.is_none());
    }

    #[test]
    fn item_state_counts_group_by_state() {
        let db = Database::open_in_memory().unwrap();
        seed_identities(&db);
        seed_transfer(&db, "t-1", "in_progress");
        let stamp = now();
        db.insert_transfer_item(&TransferItemRow {
            id: "t-1-item2".into(),
            transfer_request_id: "t-1".into(),
            filename: "b.bin".into(),
            size: 1,
            sha256: "0".repeat(64),
            mime_type: None,
            state: "finalized".into(),
            created_at: stamp,
            updated_at: stamp,
        })
        .unwrap();
        let counts = db.item_state_counts("t-1").unwrap();
        assert!(counts.contains(&("pending".to_string(), 1)));
        assert!(counts.contains(&("finalized".to_string(), 1)));
    }
}
