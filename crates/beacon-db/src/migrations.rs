use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version. Increment this and add a new migration function
/// to the `MIGRATIONS` array when the schema changes.
const CURRENT_VERSION: u32 = 1;

/// Each migration is a function that takes a connection and applies changes.
/// Migrations are applied sequentially starting from the current version + 1.
type MigrationFn = fn(&Connection) -> Result<()>;

/// Ordered list of migrations. Index 0 = version 1, index 1 = version 2, etc.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = get_current_version(conn)?;
    info!(
        "Database schema version: {} (latest: {})",
        current, CURRENT_VERSION
    );

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("Applying migration v{}", version);
        MIGRATIONS[idx](conn)?;

        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    info!("Database migrations complete (now at v{})", CURRENT_VERSION);
    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: Initial schema -- identities, catalog, ACLs, transfers, audit.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS principals (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            public_key      TEXT,
            status          TEXT NOT NULL DEFAULT 'active',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS client_devices (
            id                  TEXT PRIMARY KEY,
            principal_id        TEXT NOT NULL REFERENCES principals(id),
            name                TEXT NOT NULL,
            platform            TEXT NOT NULL,
            public_key          TEXT,
            device_secret_hash  TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'active',
            last_seen           TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pairing_sessions (
            id                          TEXT PRIMARY KEY,
            display_name                TEXT NOT NULL,
            device_name                 TEXT NOT NULL,
            platform                    TEXT NOT NULL,
            public_key                  TEXT,
            pairing_code                TEXT NOT NULL,
            status                      TEXT NOT NULL DEFAULT 'pending',
            expires_at                  TEXT NOT NULL,
            approved_by_principal_id    TEXT,
            created_at                  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_devices (
            id                  TEXT PRIMARY KEY,
            owner_principal_id  TEXT NOT NULL REFERENCES principals(id),
            name                TEXT NOT NULL,
            base_url            TEXT NOT NULL,
            visibility          INTEGER NOT NULL DEFAULT 1,
            online_state        INTEGER NOT NULL DEFAULT 1,
            last_seen           TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_agent_devices_owner
            ON agent_devices(owner_principal_id);

        CREATE TABLE IF NOT EXISTS shares (
            id              TEXT PRIMARY KEY,
            agent_device_id TEXT NOT NULL REFERENCES agent_devices(id) ON DELETE CASCADE,
            name            TEXT NOT NULL,
            root_path       TEXT NOT NULL,
            read_only       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_shares_device
            ON shares(agent_device_id);

        CREATE TABLE IF NOT EXISTS acl_grants (
            id              TEXT PRIMARY KEY,
            principal_id    TEXT NOT NULL REFERENCES principals(id),
            share_id        TEXT NOT NULL REFERENCES shares(id) ON DELETE CASCADE,
            permissions_raw TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            UNIQUE(principal_id, share_id)
        );

        CREATE TABLE IF NOT EXISTS transfer_requests (
            id                      TEXT PRIMARY KEY,
            sender_principal_id     TEXT NOT NULL REFERENCES principals(id),
            sender_client_device_id TEXT NOT NULL REFERENCES client_devices(id),
            receiver_device_id      TEXT NOT NULL REFERENCES agent_devices(id),
            receiver_share_id       TEXT NOT NULL REFERENCES shares(id),
            state                   TEXT NOT NULL DEFAULT 'pending_receiver_approval',
            reason                  TEXT,
            created_at              TEXT NOT NULL,
            expires_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transfer_requests_state
            ON transfer_requests(state);
        CREATE INDEX IF NOT EXISTS idx_transfer_requests_created
            ON transfer_requests(created_at);

        CREATE TABLE IF NOT EXISTS transfer_items (
            id                  TEXT PRIMARY KEY,
            transfer_request_id TEXT NOT NULL REFERENCES transfer_requests(id) ON DELETE CASCADE,
            filename            TEXT NOT NULL,
            size                INTEGER NOT NULL,
            sha256              TEXT NOT NULL,
            mime_type           TEXT,
            state               TEXT NOT NULL DEFAULT 'pending',
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transfer_items_request
            ON transfer_items(transfer_request_id);

        CREATE TABLE IF NOT EXISTS passcode_windows (
            id                      TEXT PRIMARY KEY,
            transfer_request_id     TEXT NOT NULL UNIQUE REFERENCES transfer_requests(id) ON DELETE CASCADE,
            passcode_hash           TEXT NOT NULL,
            attempts_left           INTEGER NOT NULL DEFAULT 5,
            failure_count           INTEGER NOT NULL DEFAULT 0,
            locked_until            TEXT,
            expires_at              TEXT NOT NULL,
            opened_at               TEXT,
            opened_by_principal_id  TEXT,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_events (
            id                  TEXT PRIMARY KEY,
            actor_principal_id  TEXT,
            action              TEXT NOT NULL,
            resource_type       TEXT NOT NULL,
            resource_id         TEXT NOT NULL,
            ip                  TEXT,
            user_agent          TEXT,
            metadata_json       TEXT,
            at                  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
