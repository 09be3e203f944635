use super::msg_types::{HandshakeMessages, HANDSHAKE_MAGIC, MAX_HANDSHAKE_FRAME, PROTOCOL_VERSION};
use super::point_to_point::{Leg, StopSignal};
use super::reader::read_frame;
use super::sender::write_frame;
use crate::error::{Error, FrameError, HandshakeFailure};
use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::trace;

/**
 * Check run on every candidate socket of a race. It is split in two so that
 * the slow part runs on the leg threads while the decision stays serialized
 * on the racing thread.
 */
pub trait Handshake: Sync {
    /**
     * State carried from `greet` to `settle`.
     */
    type Greeting: Send;

    /**
     * Runs on the leg thread that obtained `stream`. A failure rejects the
     * socket and the leg keeps trying.
     *
     * # Arguments
     *
     * `leg` - Leg that produced the socket.
     *
     * `stream` - Candidate socket.
     *
     * `stop` - Raised when the race is over; long waits must watch it.
     */
    fn greet(&self, leg: Leg, stream: &mut TcpStream, stop: &StopSignal)
        -> Result<Self::Greeting, Error>;

    /**
     * Runs on the racing thread, one candidate at a time. Success makes the
     * candidate the winner of the race.
     */
    fn settle(&self, leg: Leg, stream: &mut TcpStream, greeting: Self::Greeting)
        -> Result<(), Error>;
}

/**
 * Takes the first socket of either leg as is.
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct Unverified;

impl Handshake for Unverified {
    type Greeting = ();

    fn greet(&self, _: Leg, _: &mut TcpStream, _: &StopSignal) -> Result<(), Error> {
        Ok(())
    }

    fn settle(&self, _: Leg, _: &mut TcpStream, _: ()) -> Result<(), Error> {
        Ok(())
    }
}

/**
 * Part each end plays once a Hello was exchanged. The end with the larger
 * nonce decides which of the (usually two) mirrored sockets is kept.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Decider,
    Follower,
}

/**
 * Outcome of the leg-side exchange of a token handshake.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGreeting {
    pub role: Role,
    pub remote_nonce: u64,
}

/**
 * Minimal identity exchange that rejects sockets not opened by the intended
 * peer, and makes both ends agree on a single socket.
 *
 * Both ends send `Hello` with a per-connector random nonce and their listen
 * port, then check the remote Hello. The decider sends `Select` on the first
 * socket it settles and waits for `Confirm`; the follower waits for `Select` on
 * its greeted sockets and answers `Confirm` on the first one.
 */
#[derive(Debug, Clone)]
pub struct TokenHandshake {
    nonce: u64,
    listen_port: u16,
    expected_port: u16,
    timeout: Duration,
    poll_interval: Duration,
}

impl TokenHandshake {
    /**
     * # Arguments
     *
     * `listen_port` - Port announced to the peer: our inbound leg's port.
     *
     * `expected_port` - Port the peer must announce: the port we dial.
     *
     * `timeout` - Longest wait for each message of the peer.
     *
     * `poll_interval` - How often long waits look at the stop signal.
     */
    pub fn new(listen_port: u16, expected_port: u16, timeout: Duration, poll_interval: Duration) -> Self {
        TokenHandshake::with_nonce(rand::random(), listen_port, expected_port, timeout, poll_interval)
    }

    pub fn with_nonce(
        nonce: u64,
        listen_port: u16,
        expected_port: u16,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        TokenHandshake {
            nonce,
            listen_port,
            expected_port,
            timeout,
            poll_interval,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    fn hello(&self) -> HandshakeMessages {
        HandshakeMessages::Hello {
            magic: HANDSHAKE_MAGIC,
            version: PROTOCOL_VERSION,
            nonce: self.nonce,
            listen_port: self.listen_port,
        }
    }

    //Checks the remote Hello and returns the remote nonce
    fn verify(&self, message: HandshakeMessages) -> Result<u64, HandshakeFailure> {
        match message {
            HandshakeMessages::Hello {
                magic,
                version,
                nonce,
                listen_port,
            } => {
                if magic != HANDSHAKE_MAGIC {
                    Err(HandshakeFailure::BadMagic)
                } else if version != PROTOCOL_VERSION {
                    Err(HandshakeFailure::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: version,
                    })
                } else if listen_port != self.expected_port {
                    Err(HandshakeFailure::UnexpectedPort {
                        expected: self.expected_port,
                        announced: listen_port,
                    })
                } else if nonce == self.nonce {
                    Err(HandshakeFailure::SelfConnection)
                } else {
                    Ok(nonce)
                }
            }
            _ => Err(HandshakeFailure::UnexpectedMessage),
        }
    }

    fn receive(
        &self,
        stream: &mut TcpStream,
        stop: Option<&StopSignal>,
        until: Instant,
    ) -> Result<HandshakeMessages, HandshakeFailure> {
        let until = stop.map_or(until, |stop| until.min(stop.deadline()));
        wait_readable(stream, stop, until, self.poll_interval)?;

        //The whole frame shares one deadline, however slowly its bytes arrive
        let mut bounded = BoundedReader {
            stream: &*stream,
            stop,
            until: until.min(Instant::now() + self.timeout),
            poll_interval: self.poll_interval,
        };
        let message = read_frame(&mut bounded, MAX_HANDSHAKE_FRAME).map_err(|e| {
            if e.is_timeout() {
                HandshakeFailure::TimedOut
            } else {
                HandshakeFailure::Transport(e)
            }
        })?;
        stream.set_read_timeout(None).map_err(transport)?;

        Ok(message)
    }

    fn send(&self, stream: &mut TcpStream, message: &HandshakeMessages) -> Result<(), HandshakeFailure> {
        write_frame(stream, message, MAX_HANDSHAKE_FRAME).map_err(HandshakeFailure::Transport)
    }
}

impl Handshake for TokenHandshake {
    type Greeting = TokenGreeting;

    fn greet(
        &self,
        leg: Leg,
        stream: &mut TcpStream,
        stop: &StopSignal,
    ) -> Result<TokenGreeting, Error> {
        let fail = |reason| Error::Handshake { leg, reason };

        stream.set_nodelay(true).map_err(|e| fail(transport(e)))?;
        self.send(stream, &self.hello()).map_err(fail)?;

        let hello = self
            .receive(stream, Some(stop), Instant::now() + self.timeout)
            .map_err(fail)?;
        let remote_nonce = self.verify(hello).map_err(fail)?;

        let role = if self.nonce > remote_nonce {
            Role::Decider
        } else {
            Role::Follower
        };
        trace!(%leg, ?role, "hello exchanged");

        if role == Role::Follower {
            //The decider may settle another socket first, so wait for the whole race
            match self.receive(stream, Some(stop), stop.deadline()).map_err(fail)? {
                HandshakeMessages::Select => {}
                _ => return Err(fail(HandshakeFailure::UnexpectedMessage)),
            }
        }

        Ok(TokenGreeting { role, remote_nonce })
    }

    fn settle(&self, leg: Leg, stream: &mut TcpStream, greeting: TokenGreeting) -> Result<(), Error> {
        let fail = |reason| Error::Handshake { leg, reason };

        match greeting.role {
            Role::Decider => {
                self.send(stream, &HandshakeMessages::Select).map_err(fail)?;

                match self
                    .receive(stream, None, Instant::now() + self.timeout)
                    .map_err(fail)?
                {
                    HandshakeMessages::Confirm => Ok(()),
                    _ => Err(fail(HandshakeFailure::UnexpectedMessage)),
                }
            }
            Role::Follower => self.send(stream, &HandshakeMessages::Confirm).map_err(fail),
        }
    }
}

fn transport(e: io::Error) -> HandshakeFailure {
    HandshakeFailure::Transport(FrameError::Io(e))
}

/**
 * Blocks until at least one byte can be read from `stream`, without consuming
 * it. Gives up when `until` passes, and when the stop signal is raised.
 */
fn wait_readable(
    stream: &TcpStream,
    stop: Option<&StopSignal>,
    until: Instant,
    poll_interval: Duration,
) -> Result<(), HandshakeFailure> {
    let mut probe = [0u8; 1];

    loop {
        if stop.map_or(false, StopSignal::is_raised) {
            return Err(transport(io::Error::new(
                io::ErrorKind::Interrupted,
                "race is over",
            )));
        }

        let left = until.saturating_duration_since(Instant::now());
        if left == Duration::from_secs(0) {
            return Err(HandshakeFailure::TimedOut);
        }

        stream
            .set_read_timeout(Some(left.min(poll_interval)))
            .map_err(transport)?;

        match stream.peek(&mut probe) {
            Ok(0) => {
                return Err(transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the socket",
                )))
            }
            Ok(_) => return Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(transport(e)),
        }
    }
}

/**
 * Reads from a candidate socket in slices of at most `poll_interval`, so that
 * neither the deadline nor the stop signal can be outlived by a peer sending
 * a few bytes at a time.
 */
struct BoundedReader<'a> {
    stream: &'a TcpStream,
    stop: Option<&'a StopSignal>,
    until: Instant,
    poll_interval: Duration,
}

impl Read for BoundedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream;

        loop {
            if self.stop.map_or(false, StopSignal::is_raised) {
                //Not Interrupted, read_exact would retry it
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "race is over",
                ));
            }

            let left = self.until.saturating_duration_since(Instant::now());
            if left == Duration::from_secs(0) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake frame took too long",
                ));
            }

            stream.set_read_timeout(Some(left.min(self.poll_interval)))?;

            match stream.read(buf) {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                other => return other,
            }
        }
    }
}
