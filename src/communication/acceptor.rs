use super::handshake::Handshake;
use super::point_to_point::{Leg, LegContext, LegEvent};
use crate::error::Error;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use tracing::{debug, warn};

/**
 * Body of the inbound leg thread. Binds the local address and accepts
 * connections coming from the remote peer's host, until one passes the leg
 * side of the handshake, the deadline passes or the race is stopped.
 * Connections from any other source are dropped and listening continues.
 * The listening socket is closed when this returns.
 *
 * # Arguments
 *
 * `context` - Race state shared with the racing thread.
 */
pub(crate) fn start<H: Handshake>(context: LegContext<'_, H>) {
    let local = context.local;

    let listener = match bind(&context) {
        Ok(listener) => listener,
        Err(cause) => {
            context.fail(Leg::Inbound, cause);
            return;
        }
    };

    let expected_sources = expected_sources(context.targets);
    let poll_interval = context.configuration.get_accept_poll_interval();
    let mut last_rejection: Option<Error> = None;

    debug!(%local, "inbound leg listening");

    loop {
        if context.stop.is_raised() {
            return;
        }
        if context.stop.expired() {
            context.fail(Leg::Inbound, context.deadline_cause(Leg::Inbound, last_rejection));
            return;
        }

        match listener.accept() {
            Ok((mut stream, source)) => {
                if !expected_sources.contains(&canonical(source.ip())) {
                    warn!(%source, expected = %context.remote, "rejecting connection from unexpected source");
                    continue;
                }

                if let Err(e) = stream.set_nonblocking(false) {
                    debug!(%source, error = %e, "could not switch accepted socket to blocking");
                    continue;
                }

                match context.handshake.greet(Leg::Inbound, &mut stream, &context.stop) {
                    Ok(greeting) => {
                        debug!(%source, "inbound candidate ready");
                        let _ = context.events.send(LegEvent::Candidate {
                            leg: Leg::Inbound,
                            stream,
                            greeting,
                        });
                        return;
                    }
                    Err(e) => {
                        if context.stop.is_raised() {
                            return;
                        }
                        warn!(%source, error = %e, "inbound candidate rejected");
                        last_rejection = Some(e);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if context.stop.wait(poll_interval) {
                    return;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                ) => {}
            Err(e) => {
                context.fail(Leg::Inbound, Error::Accept(e));
                return;
            }
        }
    }
}

fn bind<H: Handshake>(context: &LegContext<'_, H>) -> Result<TcpListener, Error> {
    let local = context.local;
    let bind_error = |source| Error::Bind {
        address: local.clone(),
        source,
    };

    let listener = TcpListener::bind((local.host(), local.port())).map_err(bind_error)?;
    //Accept is polled so the leg can notice the stop signal
    listener.set_nonblocking(true).map_err(bind_error)?;

    Ok(listener)
}

fn expected_sources(targets: &[SocketAddr]) -> HashSet<IpAddr> {
    targets.iter().map(|target| canonical(target.ip())).collect()
}

//IPv4-mapped IPv6 sources are compared as IPv4
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn mapped_sources_match_their_ipv4_form() {
        let targets: Vec<SocketAddr> = vec!["127.0.0.1:42000".parse().unwrap()];
        let expected = expected_sources(&targets);
        let mapped = IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped());

        assert!(expected.contains(&canonical(mapped)));
        assert!(!expected.contains(&canonical(IpAddr::V6(Ipv6Addr::LOCALHOST))));
        assert!(!expected.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }
}
