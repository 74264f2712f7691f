//! The live measurement feed, pushed to WebSocket subscribers.

use futures::stream::{SplitSink, SplitStream};
use futures::{pin_mut, select, FutureExt, SinkExt, StreamExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tungstenite::{Error, Message};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::TaskAliveToken;
use crate::telemetry::{FeedEvent, TelemetryReporter};

/// An incoming WS stream for receiving data.
type WSIncomingStream = SplitStream<WebSocketStream<TcpStream>>;
/// An outgoing WS sink for sending data.
type WSOutgoingSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Accepts feed subscribers until the gateway shuts down.
pub async fn serve(
    listener: TcpListener,
    reporter: Arc<TelemetryReporter>,
    mut ctrlc_rx: watch::Receiver<()>,
    task_alive_token: TaskAliveToken,
) {
    loop {
        select! {
            accepted = listener.accept().fuse() => {
                let (stream, addr) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "failed to accept feed connection");
                        continue;
                    }
                };

                // Subscribe before the handshake so no event in between is missed
                let events = reporter.subscribe();
                let ctrlc_rx = ctrlc_rx.clone();
                let token = task_alive_token.clone();

                tokio::spawn(async move {
                    match FeedConnection::new(stream, addr, events, ctrlc_rx, token).await {
                        Ok(c) => c.process().await,
                        Err(e) => warn!(%addr, error = %e, "feed handshake failed"),
                    }
                });
            },
            _ = ctrlc_rx.changed().fuse() => break,
        }
    }

    debug!("feed listener stopped");
}

/// A single feed subscriber.
pub struct FeedConnection {
    addr: SocketAddr,
    ws_incoming: WSIncomingStream,
    ws_outgoing: WSOutgoingSink,
    events: broadcast::Receiver<FeedEvent>,
    ctrlc_rx: watch::Receiver<()>,
    /// Keeps the gateway from finishing shutdown until this connection is closed.
    _task_alive_token: TaskAliveToken,
}

impl FeedConnection {
    /// Completes the WebSocket handshake with the subscriber at `addr`.
    pub async fn new(
        raw_stream: TcpStream,
        addr: SocketAddr,
        events: broadcast::Receiver<FeedEvent>,
        ctrlc_rx: watch::Receiver<()>,
        task_alive_token: TaskAliveToken,
    ) -> Result<Self, Error> {
        let ws_stream = tokio_tungstenite::accept_async(raw_stream).await?;
        info!(%addr, "feed subscriber connected");

        let (ws_outgoing, ws_incoming) = ws_stream.split();

        Ok(FeedConnection {
            addr,
            ws_incoming,
            ws_outgoing,
            events,
            ctrlc_rx,
            _task_alive_token: task_alive_token,
        })
    }

    /// Pushes events to the subscriber until it disconnects or the gateway shuts down.
    pub async fn process(self) {
        // Destructure to borrow the halves independently
        let FeedConnection {
            addr,
            ws_incoming,
            mut ws_outgoing,
            mut events,
            mut ctrlc_rx,
            _task_alive_token,
        } = self;

        // Subscribers have nothing to say, so anything but a close is ignored
        let watch_client_dc = ws_incoming
            .try_for_each(|msg| async move {
                match msg {
                    Message::Close(_) => Err(Error::ConnectionClosed),
                    _ => Ok(()),
                }
            })
            .fuse();
        pin_mut!(watch_client_dc);

        loop {
            select! {
                _ = watch_client_dc => break,
                event = events.recv().fuse() => match event {
                    Ok(event) => {
                        let last = event == FeedEvent::Shutdown;
                        if send(&mut ws_outgoing, &event).await.is_err() || last {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%addr, skipped, "feed subscriber fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ctrlc_rx.changed().fuse() => {
                    let _ = send(&mut ws_outgoing, &FeedEvent::Shutdown).await;
                    break;
                },
            }
        }

        if let Err(e) = ws_outgoing.close().await {
            debug!(%addr, error = %e, "failed to close feed connection");
        }

        info!(%addr, "feed subscriber disconnected");
    }
}

async fn send(ws_outgoing: &mut WSOutgoingSink, event: &FeedEvent) -> Result<(), Error> {
    match serde_json::to_string(event) {
        Ok(json) => ws_outgoing.send(Message::text(json)).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize feed event");
            Ok(())
        }
    }
}
