use super::handshake::Handshake;
use super::point_to_point::{Leg, LegContext, LegEvent};
use crate::error::Error;
use std::io;
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, trace};

/**
 * Body of the outbound leg thread. Dials every resolved address of the remote
 * peer, waiting a doubling backoff between rounds, until a socket passes the
 * leg side of the handshake, a fatal dial error occurs, the deadline passes or
 * the race is stopped.
 *
 * # Arguments
 *
 * `context` - Race state shared with the racing thread.
 */
pub(crate) fn start<H: Handshake>(context: LegContext<'_, H>) {
    let configuration = context.configuration;
    let mut backoff = configuration.backoff.get_initial();
    let mut last_rejection: Option<Error> = None;
    let mut attempts: u32 = 0;

    debug!(remote = %context.remote, "outbound leg started");

    loop {
        for target in context.targets {
            if context.stop.is_raised() {
                return;
            }
            if context.stop.expired() {
                context.fail(Leg::Outbound, context.deadline_cause(Leg::Outbound, last_rejection));
                return;
            }

            attempts += 1;
            let attempt_timeout = configuration
                .get_dial_attempt_timeout()
                .min(context.stop.remaining())
                .max(Duration::from_millis(1));

            match TcpStream::connect_timeout(target, attempt_timeout) {
                Ok(mut stream) => match context.handshake.greet(Leg::Outbound, &mut stream, &context.stop) {
                    Ok(greeting) => {
                        debug!(%target, attempts, "outbound candidate ready");
                        let _ = context.events.send(LegEvent::Candidate {
                            leg: Leg::Outbound,
                            stream,
                            greeting,
                        });
                        return;
                    }
                    Err(e) => {
                        if context.stop.is_raised() {
                            return;
                        }
                        debug!(%target, error = %e, "outbound candidate rejected");
                        last_rejection = Some(e);
                    }
                },
                Err(e) if is_fatal(&e) => {
                    debug!(%target, error = %e, "outbound leg hit a fatal dial error");
                    context.fail(
                        Leg::Outbound,
                        Error::Dial {
                            address: context.remote.clone(),
                            source: e,
                        },
                    );
                    return;
                }
                //A failed attempt is retried, never reported
                Err(e) => trace!(%target, error = %e, "dial attempt failed"),
            }
        }

        if context.stop.wait(backoff) {
            return;
        }
        backoff = configuration.backoff.next(backoff);
    }
}

/**
 * Dial errors that no amount of retrying will fix.
 */
fn is_fatal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::Unsupported
    )
}
