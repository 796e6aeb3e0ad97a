use std::collections::HashMap;

use beacon_db::Database;
use beacon_db::models::ShareRow;
use beacon_ticket::{
    DEFAULT_EXTERNAL_PERMISSIONS, OWNER_PERMISSIONS, PermissionSet, decode_permissions,
    encode_permissions, permissions::permission_set,
};

use crate::error::ApiError;

/// Resolve one principal's permission set on one share. The owner of the
/// hosting device holds the full set without a grant row; everyone else gets
/// whatever their unique grant decodes to, or nothing.
pub fn get_permissions_for_share(
    db: &Database,
    principal_id: &str,
    share: &ShareRow,
    owner_principal_id: Option<&str>,
) -> Result<PermissionSet, ApiError> {
    let owner = match owner_principal_id {
        Some(owner) => Some(owner.to_string()),
        None => db
            .get_agent_device(&share.agent_device_id)?
            .map(|device| device.owner_principal_id),
    };

    if owner.as_deref() == Some(principal_id) {
        return Ok(permission_set(OWNER_PERMISSIONS));
    }

    let raw = db.get_grant_raw(principal_id, &share.id)?;
    Ok(decode_permissions(raw.as_deref()))
}

/// Batched variant: one grant lookup for many shares. `owner_map` maps
/// share id → owner principal id.
pub fn get_permissions_for_shares(
    db: &Database,
    principal_id: &str,
    shares: &[ShareRow],
    owner_map: &HashMap<String, String>,
) -> Result<HashMap<String, PermissionSet>, ApiError> {
    if shares.is_empty() {
        return Ok(HashMap::new());
    }

    let share_ids: Vec<String> = shares.iter().map(|share| share.id.clone()).collect();
    let grants = db.get_grants_raw_for_shares(principal_id, &share_ids)?;
    let grant_map: HashMap<String, PermissionSet> = grants
        .into_iter()
        .map(|(share_id, raw)| (share_id, decode_permissions(Some(&raw))))
        .collect();

    let mut result = HashMap::new();
    for share in shares {
        let permissions = if owner_map.get(&share.id).map(String::as_str) == Some(principal_id) {
            permission_set(OWNER_PERMISSIONS)
        } else {
            grant_map.get(&share.id).cloned().unwrap_or_default()
        };
        result.insert(share.id.clone(), permissions);
    }
    Ok(result)
}

pub fn require_permission(
    db: &Database,
    principal_id: &str,
    share: &ShareRow,
    permission: &str,
) -> Result<PermissionSet, ApiError> {
    let permissions = get_permissions_for_share(db, principal_id, share, None)?;
    if !permissions.contains(permission) {
        return Err(ApiError::Forbidden("Permission denied".into()));
    }
    Ok(permissions)
}

/// Materialize the default grant for every active non-owner principal of a
/// freshly created share.
pub fn ensure_default_grants_for_share(
    db: &Database,
    share_id: &str,
    owner_principal_id: &str,
) -> Result<(), ApiError> {
    let defaults = encode_permissions(&permission_set(DEFAULT_EXTERNAL_PERMISSIONS));
    let existing = db.list_grant_principals_for_share(share_id)?;
    for principal_id in db.list_active_principal_ids()? {
        if principal_id == owner_principal_id || existing.contains(&principal_id) {
            continue;
        }
        db.insert_grant_if_absent(&principal_id, share_id, &defaults)?;
    }
    Ok(())
}

/// Materialize default grants for a new principal against every share it
/// does not own.
pub fn ensure_default_grants_for_principal(
    db: &Database,
    principal_id: &str,
) -> Result<(), ApiError> {
    let defaults = encode_permissions(&permission_set(DEFAULT_EXTERNAL_PERMISSIONS));
    let existing = db.list_grant_share_ids_for_principal(principal_id)?;
    for (share, owner) in db.list_shares_with_owner()? {
        if owner == principal_id || existing.contains(&share.id) {
            continue;
        }
        db.insert_grant_if_absent(principal_id, &share.id, &defaults)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_db::Database;

    fn seed(db: &Database) -> ShareRow {
        db.create_principal("p-owner", "Owner", None).unwrap();
        db.create_principal("p-guest", "Guest", None).unwrap();
        db.insert_agent_device("d-1", "p-owner", "Box", "http://127.0.0.1:7001", true)
            .unwrap();
        db.insert_share("s-1", "d-1", "Home", "/srv/home", false)
            .unwrap();
        db.get_share("s-1").unwrap().unwrap()
    }

    #[test]
    fn owner_gets_full_set_without_grant_rows() {
        let db = Database::open_in_memory().unwrap();
        let share = seed(&db);
        let perms = get_permissions_for_share(&db, "p-owner", &share, None).unwrap();
        assert_eq!(perms.len(), OWNER_PERMISSIONS.len());
        assert!(perms.contains("manage_share"));
    }

    #[test]
    fn owner_set_ignores_grant_rows() {
        let db = Database::open_in_memory().unwrap();
        let share = seed(&db);
        db.upsert_grant("p-owner", "s-1", "read").unwrap();
        let perms = get_permissions_for_share(&db, "p-owner", &share, None).unwrap();
        assert!(perms.contains("manage_share"));
    }

    #[test]
    fn missing_grant_means_no_permissions() {
        let db = Database::open_in_memory().unwrap();
        let share = seed(&db);
        let perms = get_permissions_for_share(&db, "p-guest", &share, None).unwrap();
        assert!(perms.is_empty());
        assert!(require_permission(&db, "p-guest", &share, "read").is_err());
    }

    #[test]
    fn default_grants_skip_owner() {
        let db = Database::open_in_memory().unwrap();
        let share = seed(&db);
        ensure_default_grants_for_share(&db, &share.id, "p-owner").unwrap();

        let guest = get_permissions_for_share(&db, "p-guest", &share, None).unwrap();
        assert!(guest.contains("read"));
        assert!(guest.contains("download"));
        assert!(guest.contains("request_send"));
        assert!(!guest.contains("accept_incoming"));
        assert!(db.get_grant_raw("p-owner", "s-1").unwrap().is_none());
    }

    #[test]
    fn principal_bootstrap_grants_existing_shares() {
        let db = Database::open_in_memory().unwrap();
        let share = seed(&db);
        db.create_principal("p-new", "New", None).unwrap();
        ensure_default_grants_for_principal(&db, "p-new").unwrap();
        let perms = get_permissions_for_share(&db, "p-new", &share, None).unwrap();
        assert!(perms.contains("read"));
    }
}
