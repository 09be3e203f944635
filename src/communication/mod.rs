/**
 * Inbound leg: listens on the local port and accepts the peer.
 */
pub mod acceptor;
/**
 * Race wrapped with a token handshake, producing a Connection.
 */
pub mod bilateral;
/**
 * Outbound leg: dials the peer until it answers.
 */
pub mod connector;
/**
 * Checks run on candidate sockets before they may win a race.
 */
pub mod handshake;
/**
 * Wrapper for the messages sent over the TCP streams.
 */
pub mod msg_types;
/**
 * Races the two legs and keeps the first verified socket.
 */
pub mod point_to_point;
/**
 * Reads length-delimited frames.
 */
pub mod reader;
/**
 * Writes length-delimited frames.
 */
pub mod sender;
