/**
 * Established, handshake-verified connection to a peer.
 */
pub mod connection;

pub use self::connection::{Connection, DisconnectReason};
