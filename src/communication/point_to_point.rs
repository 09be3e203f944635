use super::handshake::{Handshake, Unverified};
use super::{acceptor, connector};
use crate::address::peer_address::PeerAddress;
use crate::configuration::link_configuration::Configuration;
use crate::error::Error;
use crossbeam::channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/**
 * The two strategies raced by a connector.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    ///Dialing the remote peer
    Outbound,
    ///Accepting the remote peer on the local port
    Inbound,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Outbound => f.write_str("outbound"),
            Leg::Inbound => f.write_str("inbound"),
        }
    }
}

/**
 * Lifecycle of a connector. Every state but `Init` is terminal except
 * `Racing`, which always ends in one of the other three.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Init,
    Racing,
    Connected,
    Failed,
    Cancelled,
}

/**
 * Socket that won a race, with the leg that produced it.
 */
#[derive(Debug)]
pub struct Established {
    pub leg: Leg,
    pub stream: TcpStream,
}

/**
 * Aborts a running (or not yet started) connect from any thread.
 */
#[derive(Debug, Clone)]
pub struct CancelHandle {
    channel: Sender<()>,
}

impl CancelHandle {
    /**
     * Requests cancellation. Calling it more than once, or after the connect
     * finished, has no effect.
     */
    pub fn cancel(&self) {
        let _ = self.channel.try_send(());
    }
}

/**
 * Shared by the legs of one race. It is raised when the coordinator drops
 * the sending end of its channel, which happens as soon as the race is
 * decided, cancelled or lost.
 */
#[derive(Debug, Clone)]
pub struct StopSignal {
    channel: Receiver<()>,
    deadline: Instant,
}

impl StopSignal {
    pub(crate) fn new(channel: Receiver<()>, deadline: Instant) -> Self {
        StopSignal { channel, deadline }
    }

    pub fn is_raised(&self) -> bool {
        matches!(self.channel.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /**
     * Time left until the deadline, zero once it passed.
     */
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /**
     * Sleeps for `duration`, or less if the deadline comes first. Returns
     * true as soon as the signal is raised.
     *
     * # Arguments
     *
     * `duration` - Longest time to sleep.
     */
    pub fn wait(&self, duration: Duration) -> bool {
        match self.channel.recv_timeout(duration.min(self.remaining())) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_raised(),
        }
    }
}

/**
 * Messages sent from a leg thread to the racing thread.
 */
pub(crate) enum LegEvent<G> {
    ///A socket passed the leg-side part of the handshake
    Candidate {
        leg: Leg,
        stream: TcpStream,
        greeting: G,
    },
    ///The leg gave up
    Failed { leg: Leg, cause: Error },
}

/**
 * Everything a leg thread needs, borrowed from the racing thread.
 */
pub(crate) struct LegContext<'a, H: Handshake> {
    pub local: &'a PeerAddress,
    pub remote: &'a PeerAddress,
    pub targets: &'a [SocketAddr],
    pub configuration: &'a Configuration,
    pub handshake: &'a H,
    pub stop: StopSignal,
    pub events: Sender<LegEvent<H::Greeting>>,
}

impl<'a, H: Handshake> LegContext<'a, H> {
    /**
     * Reports the terminal failure of a leg. A missing receiver means the race
     * is over, so the report is dropped.
     */
    pub fn fail(&self, leg: Leg, cause: Error) {
        let _ = self.events.send(LegEvent::Failed { leg, cause });
    }

    /**
     * Cause reported when the deadline passes: the last candidate rejection,
     * or a timeout when the leg never got that far.
     */
    pub fn deadline_cause(&self, leg: Leg, last_rejection: Option<Error>) -> Error {
        last_rejection.unwrap_or(Error::Timeout {
            leg,
            after: self.configuration.get_connect_timeout(),
        })
    }
}

/**
 * Establishes one raw bidirectional stream to a peer by racing an outbound
 * dial against an inbound accept on the local port. The first leg whose socket
 * passes the handshake `H` wins and the other leg is stopped before `connect`
 * returns. A connector produces at most one stream.
 */
pub struct PointToPointConnector<H: Handshake = Unverified> {
    local: PeerAddress,
    remote: PeerAddress,
    configuration: Arc<Configuration>,
    handshake: H,
    state: ConnectorState,
    cancel_sender: Sender<()>,
    cancel_receiver: Receiver<()>,
}

impl PointToPointConnector<Unverified> {
    /**
     * Creates a connector that accepts the first socket of either leg as is.
     *
     * # Arguments
     *
     * `local` - Address the inbound leg listens on.
     *
     * `remote` - Address the outbound leg dials, and the only source the
     * inbound leg accepts.
     *
     * `configuration` - Deadlines and retry parameters.
     */
    pub fn new(local: PeerAddress, remote: PeerAddress, configuration: Arc<Configuration>) -> Self {
        PointToPointConnector::with_handshake(local, remote, configuration, Unverified)
    }
}

impl<H: Handshake> PointToPointConnector<H> {
    /**
     * Creates a connector whose candidate sockets must pass `handshake`.
     */
    pub fn with_handshake(
        local: PeerAddress,
        remote: PeerAddress,
        configuration: Arc<Configuration>,
        handshake: H,
    ) -> Self {
        let (cancel_sender, cancel_receiver) = bounded(1);

        PointToPointConnector {
            local,
            remote,
            configuration,
            handshake,
            state: ConnectorState::Init,
            cancel_sender,
            cancel_receiver,
        }
    }

    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            channel: self.cancel_sender.clone(),
        }
    }

    /**
     * Runs the race. Blocks until a socket won, both legs failed, or the
     * race was cancelled through a `CancelHandle`. No leg thread, listening
     * socket or losing socket outlives this call.
     */
    pub fn connect(&mut self) -> Result<Established, Error> {
        if self.state != ConnectorState::Init {
            return Err(Error::IllegalState("connector already used"));
        }
        self.state = ConnectorState::Racing;

        let result = self.race();

        self.state = match &result {
            Ok(_) => ConnectorState::Connected,
            Err(Error::Cancelled) => ConnectorState::Cancelled,
            Err(_) => ConnectorState::Failed,
        };

        result
    }

    fn race(&self) -> Result<Established, Error> {
        let targets = self.remote.resolve()?;
        let deadline = Instant::now() + self.configuration.get_connect_timeout();

        //Dropping the stop sender is what stops the legs
        let (stop_sender, stop_receiver) = bounded::<()>(0);
        let (events_sender, events_receiver) = unbounded();
        let stop = StopSignal::new(stop_receiver, deadline);

        debug!(local = %self.local, remote = %self.remote, "starting connect race");

        let outcome = crossbeam::scope(|scope| -> Result<Established, Error> {
            for leg in [Leg::Outbound, Leg::Inbound] {
                let context = LegContext {
                    local: &self.local,
                    remote: &self.remote,
                    targets: &targets,
                    configuration: &self.configuration,
                    handshake: &self.handshake,
                    stop: stop.clone(),
                    events: events_sender.clone(),
                };

                let spawned = scope
                    .builder()
                    .name(format!("{}_leg_{}", leg, self.local.port()))
                    .stack_size(self.configuration.thread_stack_size)
                    .spawn(move |_| match leg {
                        Leg::Outbound => connector::start(context),
                        Leg::Inbound => acceptor::start(context),
                    });

                if let Err(e) = spawned {
                    drop(stop_sender);
                    return Err(Error::Spawn(e));
                }
            }
            drop(events_sender);

            let outcome = self.coordinate(&events_receiver);

            //Stopping the loser before the scope joins it
            drop(stop_sender);
            outcome
        })
        .map_err(|_| Error::WorkerPanicked)?;

        //Unsettled candidates still queued are closed here
        drop(events_receiver);

        match &outcome {
            Ok(established) => {
                info!(remote = %self.remote, leg = %established.leg, "connect race won")
            }
            Err(Error::Cancelled) => info!(remote = %self.remote, "connect race cancelled"),
            Err(e) => debug!(remote = %self.remote, error = %e, "connect race lost"),
        }

        outcome
    }

    //Waits for the first settled candidate, both legs' failures, or a cancellation
    fn coordinate(
        &self,
        events: &Receiver<LegEvent<H::Greeting>>,
    ) -> Result<Established, Error> {
        let mut outbound_cause: Option<Error> = None;
        let mut inbound_cause: Option<Error> = None;

        loop {
            if outbound_cause.is_some() && inbound_cause.is_some() {
                break;
            }

            select! {
                recv(events) -> event => match event {
                    Ok(LegEvent::Candidate { leg, mut stream, greeting }) => {
                        match self.handshake.settle(leg, &mut stream, greeting) {
                            Ok(()) => return Ok(Established { leg, stream }),
                            Err(cause) => {
                                debug!(%leg, error = %cause, "candidate rejected while settling");
                                record(leg, cause, &mut outbound_cause, &mut inbound_cause);
                            }
                        }
                    }
                    Ok(LegEvent::Failed { leg, cause }) => {
                        debug!(%leg, error = %cause, "leg failed");
                        record(leg, cause, &mut outbound_cause, &mut inbound_cause);
                    }
                    //Both legs are gone
                    Err(_) => break,
                },
                recv(self.cancel_receiver) -> _ => return Err(Error::Cancelled),
            }
        }

        let after = self.configuration.get_connect_timeout();
        Err(Error::Bilateral {
            outbound: Box::new(outbound_cause.unwrap_or(Error::Timeout {
                leg: Leg::Outbound,
                after,
            })),
            inbound: Box::new(inbound_cause.unwrap_or(Error::Timeout {
                leg: Leg::Inbound,
                after,
            })),
        })
    }
}

fn record(
    leg: Leg,
    cause: Error,
    outbound_cause: &mut Option<Error>,
    inbound_cause: &mut Option<Error>,
) {
    match leg {
        Leg::Outbound => *outbound_cause = Some(cause),
        Leg::Inbound => *inbound_cause = Some(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::TcpListener;
    use std::thread;

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

    fn quick_configuration(connect_timeout: u64) -> Arc<Configuration> {
        Arc::new(Configuration {
            connect_timeout,
            dial_attempt_timeout: 200,
            handshake_timeout: 500,
            ..Configuration::default()
        })
    }

    #[test]
    fn outbound_leg_wins_against_a_plain_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = PeerAddress::from(listener.local_addr().unwrap());
        let local_port = free_port();
        let mut connector =
            PointToPointConnector::new(loopback(local_port), remote, quick_configuration(2_000));

        let established = connector.connect().unwrap();

        assert_eq!(established.leg, Leg::Outbound);
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert!(listener.accept().is_ok());
        //The losing inbound leg gave its listening port back
        assert!(TcpListener::bind(("127.0.0.1", local_port)).is_ok());
    }

    #[test]
    fn inbound_leg_wins_when_the_peer_dials_in() {
        let local_port = free_port();
        let remote_port = free_port();
        let mut connector = PointToPointConnector::new(
            loopback(local_port),
            loopback(remote_port),
            quick_configuration(3_000),
        );

        let dialer = thread::spawn(move || loop {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", local_port)) {
                return stream;
            }
            thread::sleep(Duration::from_millis(10));
        });

        let established = connector.connect().unwrap();
        let _peer_side = dialer.join().unwrap();

        assert_eq!(established.leg, Leg::Inbound);
    }

    #[test]
    fn no_reachable_peer_times_out_on_both_legs() {
        let local_port = free_port();
        let mut connector = PointToPointConnector::new(
            loopback(local_port),
            loopback(free_port()),
            quick_configuration(400),
        );

        let started = Instant::now();
        let error = connector.connect().unwrap_err();

        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(error.is_timeout());
        assert_eq!(error.outbound_cause().map(Error::kind), Some(ErrorKind::Timeout));
        assert_eq!(error.inbound_cause().map(Error::kind), Some(ErrorKind::Timeout));
        assert_eq!(connector.state(), ConnectorState::Failed);

        //The listening socket did not survive the race
        assert!(TcpListener::bind(("127.0.0.1", local_port)).is_ok());
    }

    #[test]
    fn terminal_connector_refuses_to_connect_again() {
        let mut connector = PointToPointConnector::new(
            loopback(free_port()),
            loopback(free_port()),
            quick_configuration(100),
        );
        assert!(connector.connect().is_err());

        let started = Instant::now();
        let error = connector.connect().unwrap_err();

        assert_eq!(error.kind(), ErrorKind::IllegalState);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[test]
    fn cancelling_mid_race_releases_the_port() {
        let local_port = free_port();
        let mut connector = PointToPointConnector::new(
            loopback(local_port),
            loopback(free_port()),
            quick_configuration(30_000),
        );
        let handle = connector.cancel_handle();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handle.cancel();
        });

        let started = Instant::now();
        let error = connector.connect().unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(error, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(connector.state(), ConnectorState::Cancelled);
        assert!(TcpListener::bind(("127.0.0.1", local_port)).is_ok());
    }

    #[test]
    fn cancel_before_connect_aborts_at_once() {
        let mut connector = PointToPointConnector::new(
            loopback(free_port()),
            loopback(free_port()),
            quick_configuration(30_000),
        );
        connector.cancel_handle().cancel();

        assert!(connector.connect().unwrap_err().is_cancelled());
    }

    #[test]
    fn occupied_local_port_is_an_inbound_bind_cause() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = PeerAddress::from(occupied.local_addr().unwrap());
        let mut connector =
            PointToPointConnector::new(local, loopback(free_port()), quick_configuration(300));

        let error = connector.connect().unwrap_err();

        assert_eq!(error.inbound_cause().map(Error::kind), Some(ErrorKind::Bind));
        assert_eq!(error.outbound_cause().map(Error::kind), Some(ErrorKind::Timeout));
    }

    #[test]
    fn stop_signal_is_raised_when_the_sender_drops() {
        let (sender, receiver) = bounded::<()>(0);
        let stop = StopSignal::new(receiver, Instant::now() + Duration::from_secs(5));

        assert!(!stop.is_raised());
        assert!(!stop.wait(Duration::from_millis(10)));
        drop(sender);
        assert!(stop.is_raised());
        assert!(stop.wait(Duration::from_secs(5)));
    }
}
