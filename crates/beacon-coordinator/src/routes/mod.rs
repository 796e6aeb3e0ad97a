pub mod auth;
pub mod catalog;
pub mod events;
pub mod files;
pub mod pairing;
pub mod transfers;
