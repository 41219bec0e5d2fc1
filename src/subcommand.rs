//! Subcommand transactions
//!
//! At most one subcommand is in flight per controller. Requests queue in FIFO
//! order and each one resolves exactly once: with the reply payload on ACK,
//! or with `None` on NACK or timeout. This type does no I/O; the owner writes
//! the [`Dispatch`]es it returns and arms a timer for each one.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace};

use crate::protocol::{CommandReply, SubcommandId};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A queued subcommand and whoever wants its outcome
#[derive(Debug)]
pub struct Request<R> {
    pub id: SubcommandId,
    pub args: Vec<u8>,
    /// Reply data must start with these bytes to count as the answer
    pub echo: Option<Vec<u8>>,
    pub responder: R,
}

impl<R> Request<R> {
    pub fn new(id: SubcommandId, args: Vec<u8>, responder: R) -> Self {
        Self {
            id,
            args,
            echo: None,
            responder,
        }
    }

    pub fn with_echo(mut self, echo: Vec<u8>) -> Self {
        self.echo = Some(echo);
        self
    }
}

/// A request that just became in flight and must be written now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub seq: u64,
    pub id: SubcommandId,
    pub args: Vec<u8>,
}

/// Final outcome of a request
#[derive(Debug)]
pub struct Resolved<R> {
    pub seq: u64,
    pub id: SubcommandId,
    pub data: Option<Vec<u8>>,
    pub responder: R,
}

#[derive(Debug)]
struct InFlight<R> {
    seq: u64,
    request: Request<R>,
}

#[derive(Debug)]
pub struct SubcommandQueue<R> {
    queue: VecDeque<Request<R>>,
    in_flight: Option<InFlight<R>>,
    next_seq: u64,
}

impl<R> Default for SubcommandQueue<R> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            next_seq: 0,
        }
    }
}

impl<R> SubcommandQueue<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request; returns a dispatch when the queue was idle
    pub fn enqueue(&mut self, request: Request<R>) -> Option<Dispatch> {
        trace!("Queueing subcommand {:?}", request.id);
        self.queue.push_back(request);
        self.advance()
    }

    /// Move the next queued request in flight if nothing is outstanding
    pub fn advance(&mut self) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.queue.pop_front()?;
        self.next_seq += 1;
        let dispatch = Dispatch {
            seq: self.next_seq,
            id: request.id,
            args: request.args.clone(),
        };
        debug!("Dispatching subcommand {:?} (seq {})", dispatch.id, dispatch.seq);
        self.in_flight = Some(InFlight {
            seq: dispatch.seq,
            request,
        });
        Some(dispatch)
    }

    /// Match a command reply against the in-flight request
    ///
    /// Replies for another subcommand, or acknowledged replies that do not
    /// echo the expected prefix, leave the request outstanding. A NACK
    /// carries no echo, so requests with an echo filter ignore it and are
    /// left to their deadline.
    pub fn resolve(&mut self, reply: &CommandReply) -> Option<Resolved<R>> {
        let in_flight = self.in_flight.as_ref()?;
        if reply.subcommand != in_flight.request.id as u8 {
            trace!(
                "Reply for {:?} ({:#04x}) does not match in-flight {:?}",
                SubcommandId::from_u8(reply.subcommand),
                reply.subcommand,
                in_flight.request.id
            );
            return None;
        }
        let data = if reply.is_ack() {
            if let Some(echo) = &in_flight.request.echo {
                if !reply.data.starts_with(echo) {
                    trace!("Reply to {:?} echoes a different request", in_flight.request.id);
                    return None;
                }
            }
            Some(reply.data.clone())
        } else if in_flight.request.echo.is_some() {
            trace!(
                "Ignoring NACK for {:?}; it cannot be matched to this request",
                in_flight.request.id
            );
            return None;
        } else {
            debug!("Subcommand {:?} was NACKed", in_flight.request.id);
            None
        };
        self.finish(data)
    }

    /// Resolve the in-flight request with no data if it is still `seq`
    pub fn expire(&mut self, seq: u64) -> Option<Resolved<R>> {
        if self.in_flight_seq() != Some(seq) {
            trace!("Ignoring stale deadline for seq {}", seq);
            return None;
        }
        debug!("Subcommand seq {} timed out", seq);
        self.finish(None)
    }

    fn finish(&mut self, data: Option<Vec<u8>>) -> Option<Resolved<R>> {
        let InFlight { seq, request } = self.in_flight.take()?;
        Some(Resolved {
            seq,
            id: request.id,
            data,
            responder: request.responder,
        })
    }

    pub fn in_flight_seq(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.seq)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Number of requests waiting behind the in-flight one
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Abandon every request without resolving it
    pub fn clear(&mut self) {
        self.in_flight = None;
        self.queue.clear();
    }
}
