use crate::address::discovery;
use crate::address::peer_address::PeerAddress;
use crate::communication::bilateral::BilateralConnector;
use crate::communication::point_to_point::CancelHandle;
use crate::configuration::link_configuration::Configuration;
use crate::connection::Connection;
use crate::error::Error;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

enum LinkState {
    Idle,
    Connecting(CancelHandle),
    Connected(Arc<Connection>),
}

/**
 * Application-facing entry point. Holds at most one active connection to a
 * peer, established from a peer URL and a local port. Retrying after a
 * failure is up to the caller.
 */
pub struct Link {
    configuration: Arc<Configuration>,
    state: Mutex<LinkState>,
}

impl Link {
    /**
     * # Arguments
     *
     * `configuration` - Settings shared by every connect of this link.
     */
    pub fn new(configuration: Configuration) -> Self {
        Link {
            configuration: Arc::new(configuration),
            state: Mutex::new(LinkState::Idle),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /**
     * Connects to the peer at `remote_url`, listening on `local_port` at the
     * same time. Blocks until the link is up, failed or cancelled with
     * `cancel`. Every socket of the attempt is released before this returns.
     *
     * Fails with `Error::PeerUrlFormat` on a malformed URL, with
     * `Error::IllegalState` (without any I/O) when the link is already
     * connected or connecting, and with `Error::LinkFailed` wrapping the
     * connector's error otherwise.
     *
     * # Arguments
     *
     * `remote_url` - Peer URL, `host:port`.
     *
     * `local_port` - Port to listen on for the peer's dial.
     */
    pub fn connect(&self, remote_url: &str, local_port: u16) -> Result<Arc<Connection>, Error> {
        let remote = PeerAddress::parse(remote_url)?;
        let local = PeerAddress::new(&self.configuration.bind_host, local_port)?;

        let mut connector = BilateralConnector::new(local, remote, Arc::clone(&self.configuration));

        {
            let mut state = self.lock_state();
            match &*state {
                LinkState::Connecting(_) => return Err(Error::IllegalState("link is connecting")),
                LinkState::Connected(connection) if connection.is_connected() => {
                    return Err(Error::IllegalState("link is already connected"))
                }
                _ => {}
            }
            *state = LinkState::Connecting(connector.cancel_handle());
        }

        info!(remote = %connector.remote(), local_port, "connecting link");
        let result = connector.connect();

        let mut state = self.lock_state();
        match result {
            Ok(connection) => {
                let connection = Arc::new(connection);
                *state = LinkState::Connected(Arc::clone(&connection));
                info!(peer = %connection.peer(), leg = %connection.leg(), "link established");
                Ok(connection)
            }
            Err(e) => {
                *state = LinkState::Idle;
                warn!(error = %e, "link failed");
                Err(Error::LinkFailed(Box::new(e)))
            }
        }
    }

    /**
     * Aborts an ongoing connect, which then fails with a cancellation.
     * Returns false when no connect is running.
     */
    pub fn cancel(&self) -> bool {
        match &*self.lock_state() {
            LinkState::Connecting(handle) => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /**
     * The active connection, if the link is up.
     */
    pub fn connection(&self) -> Option<Arc<Connection>> {
        match &*self.lock_state() {
            LinkState::Connected(connection) if connection.is_connected() => {
                Some(Arc::clone(connection))
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /**
     * Closes the active connection, if any, and makes the link idle.
     */
    pub fn disconnect(&self) {
        let mut state = self.lock_state();

        //A running connect is left alone, see cancel
        if let LinkState::Connected(connection) = &*state {
            let connection = Arc::clone(connection);
            *state = LinkState::Idle;
            drop(state);

            connection.close();
        }
    }

    /**
     * Addresses of the local interfaces, to be handed to the peer.
     */
    pub fn list_local_addresses(&self, ipv4_only: bool) -> Result<BTreeSet<String>, Error> {
        discovery::list_local_addresses(ipv4_only)
    }

    /**
     * Address this host is seen from on the internet, as reported by the
     * configured echo service.
     */
    pub fn external_address(&self) -> Result<String, Error> {
        discovery::external_address(&self.configuration)
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
