pub mod permissions;
pub mod token;

pub use permissions::{
    DEFAULT_EXTERNAL_PERMISSIONS, OWNER_PERMISSIONS, PERMISSIONS, PermissionSet,
    decode_permissions, encode_permissions, normalize_permissions,
};
pub use token::{
    Claims, TicketKind, TokenError, VerifyError, decode_token, issue_access_token,
    issue_events_ws_token, issue_internal_agent_ticket, issue_read_ticket, issue_token,
    issue_transfer_ticket, verify_read_ticket, verify_transfer_ticket,
};
