/**
 * Identifies the link protocol in every Hello message.
 */
pub const HANDSHAKE_MAGIC: [u8; 8] = *b"PEERLINK";

/**
 * Version of the handshake. Peers with a different version are rejected.
 */
pub const PROTOCOL_VERSION: u16 = 1;

/**
 * Largest frame read while the remote end is still unverified.
 */
pub const MAX_HANDSHAKE_FRAME: usize = 1024;

/**
 * Enum of the messages exchanged on a candidate socket before it becomes a
 * connection.
 * */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum HandshakeMessages {
    ///First message sent by both ends
    Hello {
        magic: [u8; 8],
        version: u16,
        nonce: u64,
        listen_port: u16,
    },
    ///Sent by the deciding end on the socket it picked
    Select,
    ///Answer of the other end to Select
    Confirm,
}

/**
 * Enum of the messages sent/received on an established connection.
 * */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum StreamMessages {
    ///Application payload
    Payload { msg: Vec<u8> },
    ///Terminating the connection
    Close,
}
