//! Event fan-out to matching sessions.
//!
//! The router is a pure function over the registry's session set. Each event
//! is serialized at most once per wire protocol and the resulting frame is
//! shared by every recipient. Enqueueing never blocks: a session whose queue
//! is full is reported back for eviction instead of stalling the broadcast.

use std::sync::Arc;

use huddle_core::ConnectionId;
use metrics::counter;
use tracing::{debug, warn};

use crate::event::Event;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;
use crate::protocol::WireProtocol;
use crate::session::{Frame, SendOutcome, Session};

/// Outcome of one broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sessions that matched the event's target.
    pub matched: usize,
    /// Sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions that could not accept the frame and must be evicted.
    pub evicted: Vec<ConnectionId>,
}

/// Per-broadcast encoding cache, one slot per protocol.
#[derive(Default)]
struct Encoded {
    board: Option<Option<Frame>>,
    ddp: Option<Option<Frame>>,
}

impl Encoded {
    fn frame(&mut self, protocol: WireProtocol, event: &Event) -> Option<Frame> {
        let slot = match protocol {
            WireProtocol::Board => &mut self.board,
            WireProtocol::Ddp => &mut self.ddp,
        };
        slot.get_or_insert_with(|| protocol.encode(event)).clone()
    }
}

/// Enqueue `event` on every matching session.
pub fn fan_out<'a, I>(sessions: I, event: &Event) -> DeliveryReport
where
    I: IntoIterator<Item = &'a Arc<Session>>,
{
    let target = event.target();
    let mut encoded = Encoded::default();
    let mut report = DeliveryReport::default();

    for session in sessions {
        if !target.matches(session) {
            continue;
        }
        report.matched += 1;

        let Some(frame) = encoded.frame(session.protocol(), event) else {
            continue;
        };
        match session.try_send(frame) {
            SendOutcome::Queued => report.delivered += 1,
            SendOutcome::Full => {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(
                    conn_id = %session.id(),
                    user_id = %session.user_id(),
                    drops = session.drop_count(),
                    "outbound queue full, evicting slow consumer"
                );
                report.evicted.push(session.id().clone());
            }
            SendOutcome::Closed => report.evicted.push(session.id().clone()),
        }
    }

    debug!(
        kind = event.kind(),
        matched = report.matched,
        delivered = report.delivered,
        evicted = report.evicted.len(),
        "broadcast event"
    );
    report
}
