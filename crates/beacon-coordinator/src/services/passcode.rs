use chrono::{Duration, Utc};

use beacon_db::Database;
use beacon_db::models::now;

use crate::auth::{hash_secret, verify_secret};
use crate::error::ApiError;

const MAX_ATTEMPTS: i32 = 5;

/// Exponential lockout, capped at five minutes.
pub fn lock_seconds(failure_count: i32) -> i64 {
    let exponent = failure_count.clamp(0, 8) as u32;
    (1i64 << exponent).min(300)
}

/// Validate and install (or overwrite) the sender passcode for a transfer.
/// Counters and lock state always reset; reusing a window replaces it in
/// place.
pub fn set_transfer_passcode(
    db: &Database,
    transfer_id: &str,
    passcode: &str,
    window_seconds: i64,
) -> Result<(), ApiError> {
    if passcode.len() != 4 || !passcode.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::BadRequest("Passcode must be 4 digits".into()));
    }
    let hashed = hash_secret(passcode)?;
    let expires_at = now() + Duration::seconds(window_seconds.max(1));
    db.upsert_passcode_window(transfer_id, &hashed, expires_at)?;
    Ok(())
}

/// Verify the sender's passcode against the transfer's window, applying the
/// attempt/lockout discipline. On success the window records who opened it
/// and when.
pub fn verify_passcode_for_transfer(
    db: &Database,
    transfer_id: &str,
    principal_id: &str,
    passcode: &str,
) -> Result<(), ApiError> {
    let Some(mut window) = db.get_passcode_window(transfer_id)? else {
        return Err(ApiError::BadRequest("Passcode is not configured".into()));
    };

    let at = Utc::now();
    if window.expires_at < at {
        return Err(ApiError::Gone("Passcode window expired".into()));
    }
    if let Some(locked_until) = window.locked_until {
        if locked_until > at {
            return Err(ApiError::RateLimited("Passcode temporarily locked".into()));
        }
    }

    if !verify_secret(&window.passcode_hash, passcode) {
        window.failure_count += 1;
        window.attempts_left -= 1;
        if window.attempts_left <= 0 {
            window.locked_until = Some(at + Duration::seconds(lock_seconds(window.failure_count)));
            window.attempts_left = MAX_ATTEMPTS;
        }
        db.save_passcode_window(&window)?;
        return Err(ApiError::Unauthorized("Invalid passcode".into()));
    }

    window.attempts_left = MAX_ATTEMPTS;
    window.locked_until = None;
    window.opened_at = Some(at);
    window.opened_by_principal_id = Some(principal_id.to_string());
    db.save_passcode_window(&window)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_db::models::{TransferItemRow, TransferRow};

    fn seed_transfer(db: &Database) {
        db.create_principal("p-owner", "Owner", None).unwrap();
        db.create_principal("p-sender", "Sender", None).unwrap();
        db.create_client_device("c-1", "p-sender", "Laptop", "linux", None, "hash")
            .unwrap();
        db.insert_agent_device("d-1", "p-owner", "Box", "http://127.0.0.1:7001", true)
            .unwrap();
        db.insert_share("s-1", "d-1", "Home", "/srv/home", false)
            .unwrap();
        let stamp = now();
        db.insert_transfer(&TransferRow {
            id: "t-1".into(),
            sender_principal_id: "p-sender".into(),
            sender_client_device_id: "c-1".into(),
            receiver_device_id: "d-1".into(),
            receiver_share_id: "s-1".into(),
            state: "pending_receiver_approval".into(),
            reason: None,
            created_at: stamp,
            expires_at: stamp + Duration::hours(24),
            updated_at: stamp,
        })
        .unwrap();
        db.insert_transfer_item(&TransferItemRow {
            id: "i-1".into(),
            transfer_request_id: "t-1".into(),
            filename: "a.bin".into(),
            size: 1,
            sha256: "0".repeat(64),
            mime_type: None,
            state: "pending".into(),
            created_at: stamp,
            updated_at: stamp,
        })
        .unwrap();
    }

    #[test]
    fn lock_growth_is_exponential_and_capped() {
        assert_eq!(lock_seconds(1), 2);
        assert_eq!(lock_seconds(5), 32);
        assert_eq!(lock_seconds(8), 256);
        assert_eq!(lock_seconds(9), 256);
        assert_eq!(lock_seconds(20), 256);
    }

    #[test]
    fn rejects_non_digit_passcodes() {
        let db = Database::open_in_memory().unwrap();
        seed_transfer(&db);
        assert!(set_transfer_passcode(&db, "t-1", "12a4", 300).is_err());
        assert!(set_transfer_passcode(&db, "t-1", "123", 300).is_err());
        assert!(set_transfer_passcode(&db, "t-1", "12345", 300).is_err());
        assert!(set_transfer_passcode(&db, "t-1", "4242", 300).is_ok());
    }

    #[test]
    fn five_failures_lock_the_window() {
        let db = Database::open_in_memory().unwrap();
        seed_transfer(&db);
        set_transfer_passcode(&db, "t-1", "4242", 300).unwrap();

        for attempt in 0..5 {
            let err = verify_passcode_for_transfer(&db, "t-1", "p-sender", "0000").unwrap_err();
            assert!(
                matches!(err, ApiError::Unauthorized(_)),
                "attempt {attempt} should fail with invalid passcode"
            );
        }

        let window = db.get_passcode_window("t-1").unwrap().unwrap();
        assert_eq!(window.failure_count, 5);
        assert_eq!(window.attempts_left, 5);
        let locked_until = window.locked_until.expect("window should be locked");
        let lock = locked_until - Utc::now();
        assert!(lock.num_seconds() > 25 && lock.num_seconds() <= 32);

        let err = verify_passcode_for_transfer(&db, "t-1", "p-sender", "4242").unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)));
    }

    #[test]
    fn success_resets_counters() {
        let db = Database::open_in_memory().unwrap();
        seed_transfer(&db);
        set_transfer_passcode(&db, "t-1", "4242", 300).unwrap();

        let _ = verify_passcode_for_transfer(&db, "t-1", "p-sender", "1111");
        verify_passcode_for_transfer(&db, "t-1", "p-sender", "4242").unwrap();

        let window = db.get_passcode_window("t-1").unwrap().unwrap();
        assert_eq!(window.attempts_left, 5);
        assert!(window.locked_until.is_none());
        assert_eq!(window.opened_by_principal_id.as_deref(), Some("p-sender"));
        assert!(window.opened_at.is_some());
    }

    #[test]
    fn expired_window_is_gone() {
        let db = Database::open_in_memory().unwrap();
        seed_transfer(&db);
        set_transfer_passcode(&db, "t-1", "4242", 300).unwrap();
        let mut window = db.get_passcode_window("t-1").unwrap().unwrap();
        window.locked_until = None;
        db.save_passcode_window(&window).unwrap();
        // Shrink expiry directly; save_passcode_window does not touch it.
        db.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE passcode_windows SET expires_at = ?1 WHERE transfer_request_id = 't-1'",
                [beacon_db::models::dt_to_sql(now() - Duration::seconds(5))],
            )?;
            Ok(())
        })
        .unwrap();

        let err = verify_passcode_for_transfer(&db, "t-1", "p-sender", "4242").unwrap_err();
        assert!(matches!(err, ApiError::Gone(_)));
    }
}
