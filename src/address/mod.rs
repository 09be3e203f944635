/**
 * Discovery of the local and external addresses of this host.
 */
pub mod discovery;
/**
 * Peer address value type and its URL text form.
 */
pub mod peer_address;
