//! Direct peer-to-peer links without a rendezvous server: both peers know each
//! other's address and port, and each one dials the other while listening for
//! the other's dial. The first socket that passes a token handshake becomes the
//! link's single connection.
extern crate bincode;
extern crate crossbeam;
extern crate serde;
#[macro_use]
extern crate serde_derive;
/**
 * Peer addresses and address discovery.
 */
pub mod address;
/**
 * Dial/listen race, handshake and wire framing.
 */
pub mod communication;
/**
 * Link configuration.
 */
pub mod configuration;
/**
 * Established connection to a peer.
 */
pub mod connection;
/**
 * Error kinds of the link subsystem.
 */
pub mod error;
/**
 * Application-facing link façade.
 */
pub mod link;
/**
 * Tracing subscriber setup.
 */
pub mod logging;

pub use address::peer_address::PeerAddress;
pub use communication::bilateral::BilateralConnector;
pub use communication::point_to_point::{CancelHandle, ConnectorState, Leg, PointToPointConnector};
pub use configuration::link_configuration::Configuration;
pub use connection::{Connection, DisconnectReason};
pub use error::{Error, ErrorKind};
pub use link::Link;
