use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::TransferView;

/// Events pushed to clients over the coordinator WebSocket.
///
/// Each event is delivered to the principals involved in the transfer, never
/// broadcast. Serialized with a flat `type` tag so browser clients can switch
/// on `event.type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A sender asked to push files to one of the receiver's shares.
    TransferRequested { transfer: TransferView },

    /// The receiver approved and set a passcode.
    TransferApproved { transfer: TransferView },

    /// The receiver rejected the request.
    TransferRejected { transfer: TransferView },

    /// The sender entered the correct passcode; uploads may begin.
    TransferPasscodeOpened { transfer: TransferView },

    /// A transfer was cancelled by either party.
    TransferCancelled { transfer: TransferView },

    /// An item changed state on the receiving agent.
    TransferItemState {
        transfer_id: String,
        transfer_state: String,
        item: ItemStateBrief,
        updated_at: DateTime<Utc>,
    },

    /// Keep-alive reply to any client text frame.
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStateBrief {
    pub id: String,
    pub state: String,
}
