use super::handshake::TokenHandshake;
use super::point_to_point::{CancelHandle, ConnectorState, PointToPointConnector};
use crate::address::peer_address::PeerAddress;
use crate::configuration::link_configuration::Configuration;
use crate::connection::Connection;
use crate::error::Error;
use std::sync::Arc;

/**
 * Point-to-point race whose candidate sockets must pass a token handshake
 * before the race counts them. Rejected candidates are attributed to the leg
 * that produced them; when both legs fail, the error carries both causes.
 */
pub struct BilateralConnector {
    race: PointToPointConnector<TokenHandshake>,
    configuration: Arc<Configuration>,
}

impl BilateralConnector {
    /**
     * # Arguments
     *
     * `local` - Address the inbound leg listens on. Its port is announced to
     * the peer during the handshake.
     *
     * `remote` - Address of the peer. Its port is the one the peer must
     * announce.
     *
     * `configuration` - Deadlines and retry parameters.
     */
    pub fn new(local: PeerAddress, remote: PeerAddress, configuration: Arc<Configuration>) -> Self {
        let handshake = TokenHandshake::new(
            local.port(),
            remote.port(),
            configuration.get_handshake_timeout(),
            configuration.get_accept_poll_interval(),
        );

        BilateralConnector {
            race: PointToPointConnector::with_handshake(
                local,
                remote,
                Arc::clone(&configuration),
                handshake,
            ),
            configuration,
        }
    }

    pub fn local(&self) -> &PeerAddress {
        self.race.local()
    }

    pub fn remote(&self) -> &PeerAddress {
        self.race.remote()
    }

    pub fn state(&self) -> ConnectorState {
        self.race.state()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.race.cancel_handle()
    }

    /**
     * Races, verifies the winning socket and wraps it in a Connection.
     * Fails with `Error::IllegalState` without any I/O when called again.
     */
    pub fn connect(&mut self) -> Result<Connection, Error> {
        let established = self.race.connect()?;

        Connection::new(
            established.stream,
            self.race.remote().clone(),
            established.leg,
            self.configuration.max_frame_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::msg_types::{HandshakeMessages, MAX_HANDSHAKE_FRAME};
    use crate::communication::point_to_point::Leg;
    use crate::communication::sender::write_frame;
    use crate::error::{ErrorKind, HandshakeFailure};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn loopback(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port).unwrap()
    }

    fn configuration(connect_timeout: u64) -> Arc<Configuration> {
        Arc::new(Configuration {
            connect_timeout,
            dial_attempt_timeout: 200,
            handshake_timeout: 300,
            ..Configuration::default()
        })
    }

    fn dial_until_connected(port: u16) -> TcpStream {
        loop {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
                return stream;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn mirrored_connectors_share_one_socket() {
        let (port_a, port_b) = (free_port(), free_port());
        let mut first = BilateralConnector::new(loopback(port_a), loopback(port_b), configuration(5_000));
        let mut second = BilateralConnector::new(loopback(port_b), loopback(port_a), configuration(5_000));

        let other = thread::spawn(move || second.connect());
        let a = first.connect().unwrap();
        let b = other.join().unwrap().unwrap();

        //Both ends hold the two ends of the same TCP connection
        assert_eq!(a.local_addr(), b.peer_addr());
        assert_eq!(a.peer_addr(), b.local_addr());

        a.send(b"ping").unwrap();
        assert_eq!(b.receive().unwrap(), b"ping".to_vec());

        //Neither listener outlives a won race
        assert!(TcpListener::bind(("127.0.0.1", port_a)).is_ok());
        assert!(TcpListener::bind(("127.0.0.1", port_b)).is_ok());
    }

    #[test]
    fn stray_connection_is_rejected_and_listening_continues() {
        let (local_port, remote_port) = (free_port(), free_port());
        let mut connector =
            BilateralConnector::new(loopback(local_port), loopback(remote_port), configuration(3_000));

        let peer = thread::spawn(move || {
            //An unrelated client speaking another protocol
            let mut stray = dial_until_connected(local_port);
            stray.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
            thread::sleep(Duration::from_millis(100));

            let mut peer = BilateralConnector::new(
                loopback(remote_port),
                loopback(local_port),
                configuration(3_000),
            );
            peer.connect()
        });

        let connection = connector.connect().unwrap();
        let peer_connection = peer.join().unwrap().unwrap();

        assert!(connection.is_connected());
        assert!(peer_connection.is_connected());
    }

    #[test]
    fn silent_peer_leaves_a_handshake_cause_on_the_inbound_leg() {
        let (local_port, remote_port) = (free_port(), free_port());
        let mut connector =
            BilateralConnector::new(loopback(local_port), loopback(remote_port), configuration(800));

        let impostor = thread::spawn(move || {
            let mut stream = dial_until_connected(local_port);
            let hello = HandshakeMessages::Hello {
                magic: *b"NOTPEERS",
                version: 1,
                nonce: 7,
                listen_port: remote_port,
            };
            write_frame(&mut stream, &hello, MAX_HANDSHAKE_FRAME).unwrap();
            thread::sleep(Duration::from_millis(1_000));
        });

        let error = connector.connect().unwrap_err();
        impostor.join().unwrap();

        assert_eq!(error.kind(), ErrorKind::Bilateral);
        assert!(matches!(
            error.inbound_cause(),
            Some(Error::Handshake {
                leg: Leg::Inbound,
                reason: HandshakeFailure::BadMagic
            })
        ));
        assert_eq!(error.outbound_cause().map(Error::kind), Some(ErrorKind::Timeout));
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[test]
    fn trickling_stray_does_not_delay_cancellation() {
        let (local_port, remote_port) = (free_port(), free_port());
        let mut connector = BilateralConnector::new(
            loopback(local_port),
            loopback(remote_port),
            Arc::new(Configuration {
                connect_timeout: 60_000,
                dial_attempt_timeout: 200,
                handshake_timeout: 500,
                ..Configuration::default()
            }),
        );
        let handle = connector.cancel_handle();

        //Announces a large frame and feeds it one byte at a time, each within the handshake timeout
        thread::spawn(move || {
            let mut stray = dial_until_connected(local_port);
            if stray.write_all(&1000u32.to_be_bytes()).is_err() {
                return;
            }
            for _ in 0..100 {
                thread::sleep(Duration::from_millis(300));
                if stray.write_all(&[0]).is_err() {
                    return;
                }
            }
        });
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            handle.cancel();
        });

        let started = Instant::now();
        let error = connector.connect().unwrap_err();
        interrupter.join().unwrap();

        assert_eq!(error.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(TcpListener::bind(("127.0.0.1", local_port)).is_ok());
    }
}
