use beacon_db::Database;
use beacon_db::models::{TransferItemRow, TransferRow};
use beacon_types::models::{TransferItemView, TransferView};

use crate::error::ApiError;

pub fn item_to_view(item: &TransferItemRow) -> TransferItemView {
    TransferItemView {
        id: item.id.clone(),
        filename: item.filename.clone(),
        size: item.size.max(0) as u64,
        sha256: item.sha256.clone(),
        mime_type: item.mime_type.clone(),
        state: item.state.clone(),
    }
}

pub fn transfer_to_view(db: &Database, transfer: &TransferRow) -> Result<TransferView, ApiError> {
    let items = db.get_transfer_items(&transfer.id)?;
    Ok(TransferView {
        id: transfer.id.clone(),
        sender_principal_id: transfer.sender_principal_id.clone(),
        sender_client_device_id: transfer.sender_client_device_id.clone(),
        receiver_device_id: transfer.receiver_device_id.clone(),
        receiver_share_id: transfer.receiver_share_id.clone(),
        state: transfer.state.clone(),
        reason: transfer.reason.clone(),
        created_at: transfer.created_at,
        expires_at: transfer.expires_at,
        updated_at: transfer.updated_at,
        items: items.iter().map(item_to_view).collect(),
    })
}
