use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

/// Liveness horizon: a device is online iff its agent said so and the last
/// heartbeat is at most this old.
pub const ONLINE_HORIZON_SECONDS: i64 = 90;

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn dt_to_sql(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn dt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub fn opt_dt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
            }),
    }
}

#[derive(Debug, Clone)]
pub struct PrincipalRow {
    pub id: String,
    pub display_name: String,
    pub public_key: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClientDeviceRow {
    pub id: String,
    pub principal_id: String,
    pub name: String,
    pub platform: String,
    pub public_key: Option<String>,
    pub device_secret_hash: String,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PairingSessionRow {
    pub id: String,
    pub display_name: String,
    pub device_name: String,
    pub platform: String,
    pub public_key: Option<String>,
    pub pairing_code: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub approved_by_principal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentDeviceRow {
    pub id: String,
    pub owner_principal_id: String,
    pub name: String,
    pub base_url: String,
    pub visibility: bool,
    pub online_state: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentDeviceRow {
    /// Online iff the agent reported itself up and the heartbeat is fresh.
    pub fn is_online_at(&self, at: DateTime<Utc>) -> bool {
        match self.last_seen {
            Some(last_seen) => {
                self.online_state && at - last_seen <= Duration::seconds(ONLINE_HORIZON_SECONDS)
            }
            None => false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_online_at(now())
    }
}

#[derive(Debug, Clone)]
pub struct ShareRow {
    pub id: String,
    pub agent_device_id: String,
    pub name: String,
    pub root_path: String,
    pub read_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransferRow {
    pub id: String,
    pub sender_principal_id: String,
    pub sender_client_device_id: String,
    pub receiver_device_id: String,
    pub receiver_share_id: String,
    pub state: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransferItemRow {
    pub id: String,
    pub transfer_request_id: String,
    pub filename: String,
    pub size: i64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PasscodeWindowRow {
    pub id: String,
    pub transfer_request_id: String,
    pub passcode_hash: String,
    pub attempts_left: i32,
    pub failure_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub opened_by_principal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(online_state: bool, last_seen: Option<DateTime<Utc>>) -> AgentDeviceRow {
        AgentDeviceRow {
            id: "d-1".into(),
            owner_principal_id: "p-1".into(),
            name: "Device".into(),
            base_url: "http://127.0.0.1:7001".into(),
            visibility: true,
            online_state,
            last_seen,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn online_requires_fresh_heartbeat() {
        let at = now();
        assert!(device(true, Some(at - Duration::seconds(10))).is_online_at(at));
        assert!(!device(true, Some(at - Duration::seconds(120))).is_online_at(at));
        assert!(!device(false, Some(at)).is_online_at(at));
        assert!(!device(true, None).is_online_at(at));
    }

    #[test]
    fn datetime_round_trips_through_sql_text() {
        let value = now();
        let encoded = dt_to_sql(value);
        let parsed = DateTime::parse_from_rfc3339(&encoded)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed, value);
    }
}
