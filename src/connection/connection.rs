use crate::address::peer_address::PeerAddress;
use crate::communication::msg_types::StreamMessages;
use crate::communication::point_to_point::Leg;
use crate::communication::reader::read_frame;
use crate::communication::sender::write_frame;
use crate::error::{Error, FrameError};
use std::fmt;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, TryLockError};
use std::time::Duration;
use tracing::debug;

/**
 * Why a connection left the CONNECTED state.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ///`close` was called on this end
    Local,
    ///The peer sent a disconnect frame
    Peer,
    ///The transport failed without a disconnect frame
    Lost,
}

const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_millis(200);

type DisconnectCallback = Box<dyn FnOnce(DisconnectReason) + Send>;

struct Lifecycle {
    reason: Option<DisconnectReason>,
    callback: Option<DisconnectCallback>,
}

/**
 * Live link to a peer, owning its socket exclusively. Exchanges
 * length-delimited message frames. Once closed, by either end or by a
 * transport failure, it never reconnects.
 *
 * `send` and `receive` may be used from different threads at the same time.
 */
pub struct Connection {
    peer: PeerAddress,
    leg: Leg,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    ///Handle used to shut the socket down while another thread is blocked on it
    control: TcpStream,
    lifecycle: Mutex<Lifecycle>,
}

impl Connection {
    /**
     * Wraps a socket that passed the handshake.
     *
     * # Arguments
     *
     * `stream` - Socket won by the race.
     *
     * `peer` - Address the socket was established with.
     *
     * `leg` - Leg that produced the socket.
     *
     * `max_frame_size` - Largest frame accepted from the peer.
     */
    pub fn new(
        stream: TcpStream,
        peer: PeerAddress,
        leg: Leg,
        max_frame_size: usize,
    ) -> Result<Connection, Error> {
        let setup = |stream: &TcpStream| -> std::io::Result<(SocketAddr, SocketAddr, TcpStream, TcpStream)> {
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(None)?;
            stream.set_nodelay(true)?;
            Ok((
                stream.local_addr()?,
                stream.peer_addr()?,
                stream.try_clone()?,
                stream.try_clone()?,
            ))
        };
        let (local_addr, peer_addr, writer, control) =
            setup(&stream).map_err(|e| Error::ConnectionLost(FrameError::Io(e)))?;

        debug!(%peer, %leg, %local_addr, %peer_addr, "connection established");

        Ok(Connection {
            peer,
            leg,
            local_addr,
            peer_addr,
            max_frame_size,
            reader: Mutex::new(BufReader::new(stream)),
            writer: Mutex::new(writer),
            control,
            lifecycle: Mutex::new(Lifecycle {
                reason: None,
                callback: None,
            }),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /**
     * True from the successful handshake until the connection closes.
     */
    pub fn is_connected(&self) -> bool {
        self.disconnect_reason().is_none()
    }

    /**
     * Why the connection closed, `None` while it is connected.
     */
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lock_lifecycle().reason
    }

    /**
     * Registers the callback fired when the connection closes. It fires
     * exactly once; if the connection is already closed it fires right away.
     * A new registration replaces a pending one.
     *
     * # Arguments
     *
     * `callback` - Receives the reason of the close.
     */
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        let fire_now = {
            let mut lifecycle = self.lock_lifecycle();
            match lifecycle.reason {
                Some(reason) => Some(reason),
                None => {
                    lifecycle.callback = Some(Box::new(callback));
                    return;
                }
            }
        };

        if let Some(reason) = fire_now {
            callback(reason);
        }
    }

    /**
     * Sends one application message to the peer.
     *
     * # Arguments
     *
     * `msg` - Serialized application message.
     */
    pub fn send(&self, msg: &[u8]) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }

        let message = StreamMessages::Payload { msg: msg.to_vec() };
        let mut writer = self.lock_writer();

        match write_frame(&mut *writer, &message, self.max_frame_size) {
            Ok(()) => Ok(()),
            //Nothing was written, the connection is still usable
            Err(e @ FrameError::TooLarge { .. }) => Err(Error::Frame(e)),
            Err(e) => {
                drop(writer);
                Err(self.fail(e))
            }
        }
    }

    /**
     * Blocks until the next application message arrives. A disconnect frame
     * closes the connection and is reported as `Error::PeerDisconnected`; any
     * other transport failure closes it as `Error::ConnectionLost`.
     */
    pub fn receive(&self) -> Result<Vec<u8>, Error> {
        if !self.is_connected() {
            return Err(Error::Closed);
        }

        let mut reader = self.lock_reader();
        let frame = read_frame::<_, StreamMessages>(&mut *reader, self.max_frame_size);
        drop(reader);

        match frame {
            Ok(StreamMessages::Payload { msg }) => Ok(msg),
            Ok(StreamMessages::Close) => {
                if self.transition(DisconnectReason::Peer) {
                    debug!(peer = %self.peer, "peer disconnected");
                    Err(Error::PeerDisconnected)
                } else {
                    Err(Error::Closed)
                }
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /**
     * Closes the connection: a disconnect frame is sent on a best-effort
     * basis, then the socket is shut down. Idempotent.
     */
    pub fn close(&self) {
        if !self.is_connected() {
            return;
        }

        //A sender stuck on a full buffer holds the writer, the shutdown below releases it
        match self.writer.try_lock() {
            Ok(mut writer) => self.send_close_frame(&mut writer),
            Err(TryLockError::Poisoned(poisoned)) => {
                self.send_close_frame(&mut poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => {}
        }

        if self.transition(DisconnectReason::Local) {
            debug!(peer = %self.peer, "connection closed");
        }
    }

    fn send_close_frame(&self, writer: &mut TcpStream) {
        //A peer that stopped reading must not hold the close up
        let _ = writer.set_write_timeout(Some(CLOSE_FRAME_TIMEOUT));
        let _ = write_frame(writer, &StreamMessages::Close, self.max_frame_size);
    }

    //Reports a transport failure, unless the connection was already closed
    fn fail(&self, error: FrameError) -> Error {
        if self.transition(DisconnectReason::Lost) {
            debug!(peer = %self.peer, error = %error, "connection lost");
            Error::ConnectionLost(error)
        } else {
            Error::Closed
        }
    }

    /**
     * Moves to CLOSED. Only the first call does anything: it records the
     * reason, shuts the socket down and fires the callback. Returns whether
     * this call was the one that closed the connection.
     */
    fn transition(&self, reason: DisconnectReason) -> bool {
        let callback = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.reason.is_some() {
                return false;
            }
            lifecycle.reason = Some(reason);
            lifecycle.callback.take()
        };

        let _ = self.control.shutdown(Shutdown::Both);

        if let Some(callback) = callback {
            callback(reason);
        }

        true
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, BufReader<TcpStream>> {
        self.reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, TcpStream> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("leg", &self.leg)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("reason", &self.disconnect_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn raw_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn wrap(stream: TcpStream, leg: Leg) -> Connection {
        let peer = PeerAddress::from(stream.peer_addr().unwrap());
        Connection::new(stream, peer, leg, 1024).unwrap()
    }

    fn pair() -> (Connection, Connection) {
        let (client, server) = raw_pair();
        (wrap(client, Leg::Outbound), wrap(server, Leg::Inbound))
    }

    fn counting_callback(
        connection: &Connection,
    ) -> (Arc<AtomicUsize>, Arc<Mutex<Option<DisconnectReason>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let (count_clone, seen_clone) = (Arc::clone(&count), Arc::clone(&seen));

        connection.on_disconnect(move |reason| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            *seen_clone.lock().unwrap() = Some(reason);
        });

        (count, seen)
    }

    #[test]
    fn messages_flow_both_ways() {
        let (a, b) = pair();

        a.send(b"file-offer").unwrap();
        b.send(b"accept").unwrap();

        assert_eq!(b.receive().unwrap(), b"file-offer".to_vec());
        assert_eq!(a.receive().unwrap(), b"accept".to_vec());
        assert_eq!(a.leg(), Leg::Outbound);
        assert_eq!(b.leg(), Leg::Inbound);
    }

    #[test]
    fn disconnect_frame_closes_and_fires_the_callback_once() {
        let (a, b) = pair();
        let (count, seen) = counting_callback(&b);

        a.close();
        let error = b.receive().unwrap_err();

        assert!(matches!(error, Error::PeerDisconnected));
        assert!(!b.is_connected());
        assert_eq!(b.disconnect_reason(), Some(DisconnectReason::Peer));
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::Peer));

        b.close();
        assert!(matches!(b.receive(), Err(Error::Closed)));
        assert!(matches!(b.send(b"late"), Err(Error::Closed)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abrupt_loss_is_not_a_peer_disconnect() {
        let (client, server) = raw_pair();
        let b = wrap(server, Leg::Inbound);
        let (count, seen) = counting_callback(&b);

        //The peer vanishes without a disconnect frame
        drop(client);
        let error = b.receive().unwrap_err();

        assert!(matches!(error, Error::ConnectionLost(_)));
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::Lost));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!b.is_connected());
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = pair();
        let (count, seen) = counting_callback(&a);

        a.close();
        a.close();

        assert!(!a.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::Local));
    }

    #[test]
    fn late_registration_fires_immediately() {
        let (a, _b) = pair();
        a.close();

        let (count, seen) = counting_callback(&a);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::Local));
    }

    #[test]
    fn close_unblocks_a_pending_receive() {
        let (a, _b) = pair();
        let a = Arc::new(a);
        let receiver = Arc::clone(&a);

        let pending = thread::spawn(move || receiver.receive());
        thread::sleep(Duration::from_millis(100));
        a.close();

        assert!(matches!(pending.join().unwrap(), Err(Error::Closed)));
    }

    #[test]
    fn oversized_frames_from_the_peer_drop_the_connection() {
        let (mut client, server) = raw_pair();
        let b = wrap(server, Leg::Inbound);

        client.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();

        assert!(matches!(
            b.receive(),
            Err(Error::ConnectionLost(FrameError::TooLarge { .. }))
        ));
    }

    #[test]
    fn oversized_outgoing_messages_keep_the_connection() {
        let (a, b) = pair();

        assert!(matches!(a.send(&[0u8; 4096]), Err(Error::Frame(_))));
        assert!(a.is_connected());

        a.send(b"small").unwrap();
        assert_eq!(b.receive().unwrap(), b"small".to_vec());
    }

    #[test]
    fn close_does_not_wait_for_a_blocked_sender() {
        let (client, _server) = raw_pair();
        let peer = PeerAddress::from(client.peer_addr().unwrap());
        let a = Arc::new(Connection::new(client, peer, Leg::Outbound, 64 * 1024 * 1024).unwrap());

        //The other end never reads, so the send buffer fills up
        let flooding = {
            let a = Arc::clone(&a);
            thread::spawn(move || {
                let chunk = vec![0u8; 1024 * 1024];
                loop {
                    if let Err(e) = a.send(&chunk) {
                        return e;
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(500));

        let (done, closed) = crossbeam::channel::bounded(1);
        let closer = Arc::clone(&a);
        let started = Instant::now();
        thread::spawn(move || {
            closer.close();
            let _ = done.send(());
        });

        assert!(closed.recv_timeout(Duration::from_secs(3)).is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!a.is_connected());
        assert!(matches!(flooding.join().unwrap(), Error::Closed));
    }
}
