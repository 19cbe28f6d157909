//! Per-session I/O pumps.
//!
//! Each registered session runs one reader (this task) and one writer
//! (spawned). The writer is the only code that writes to the socket: it
//! drains the outbound queue and sends keepalives. The reader feeds inbound
//! frames to the session's protocol handler in arrival order.
//!
//! Whichever pump ends first, the session is unregistered. Unregistering
//! closes the outbound queue, which lets the writer flush, send a Close frame
//! and exit.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, debug, info, instrument};

use crate::protocol::{ProtocolHandler, WireProtocol};
use crate::registry::{DisconnectReason, RegistryHandle};
use crate::session::{Frame, Session};

/// How long the reader waits for the writer to flush after unregistering.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Drive a registered session until either side of the socket fails.
///
/// The session must already be registered; it is unregistered before this
/// returns.
#[instrument(skip_all, fields(conn_id = %session.id(), user_id = %session.user_id()))]
pub async fn run_session<S, E>(
    socket: S,
    session: Arc<Session>,
    outbound: mpsc::Receiver<Frame>,
    mut handler: Box<dyn ProtocolHandler>,
    registry: RegistryHandle,
    keepalive: Duration,
) -> DisconnectReason
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(
        write_pump(sink, outbound, session.protocol(), keepalive).in_current_span(),
    );

    handler.on_registered();
    // The writer can only stop the reader between frames. A frame that has
    // reached the handler is always processed to the end.
    let reason = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            joined = &mut writer => break joined.unwrap_or(DisconnectReason::WriteFailed),
        };
        if let Some(reason) = dispatch(frame, &session, handler.as_mut()).await {
            break reason;
        }
    };
    handler.on_closed();

    registry.unregister(session.id(), reason);
    if !writer.is_finished() && time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!("writer did not drain in time, aborting");
        writer.abort();
    }

    info!(
        reason = reason.as_str(),
        age_secs = session.age().as_secs(),
        dropped = session.drop_count(),
        "session ended"
    );
    reason
}

/// Feed one inbound frame to the handler. Returns the disconnect reason once
/// the client side is done.
async fn dispatch<E>(
    frame: Option<Result<Message, E>>,
    session: &Session,
    handler: &mut dyn ProtocolHandler,
) -> Option<DisconnectReason>
where
    E: Display,
{
    let message = match frame {
        Some(Ok(message)) => message,
        Some(Err(e)) => {
            debug!(error = %e, "transport read failed");
            return Some(DisconnectReason::TransportError);
        }
        None => return Some(DisconnectReason::ClientClosed),
    };
    match message {
        Message::Text(text) => handler.on_text(text.as_str()).await,
        // Some clients send JSON in binary frames
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => handler.on_text(text).await,
            Err(_) => info!(len = data.len(), "ignoring non-UTF8 binary frame"),
        },
        Message::Ping(_) | Message::Pong(_) => {
            session.mark_alive();
            handler.on_pong();
        }
        Message::Close(_) => {
            debug!("client sent close frame");
            return Some(DisconnectReason::ClientClosed);
        }
    }
    None
}

async fn write_pump<Si, E>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Frame>,
    protocol: WireProtocol,
    keepalive: Duration,
) -> DisconnectReason
where
    Si: Sink<Message, Error = E> + Unpin,
    E: Display,
{
    let mut keepalive_interval = time::interval(keepalive);
    keepalive_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = keepalive_interval.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return DisconnectReason::QueueClosed;
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!(error = %e, "transport write failed");
                    return DisconnectReason::WriteFailed;
                }
            }
            _ = keepalive_interval.tick() => {
                if let Err(e) = sink.send(protocol.keepalive()).await {
                    debug!(error = %e, "keepalive write failed");
                    return DisconnectReason::WriteFailed;
                }
            }
        }
    }
}
