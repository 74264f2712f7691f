//! The request/acknowledgement exchange with the controller over the serial link.
//!
//! Two tasks share the link. The receive task turns the raw byte stream into frames, hands
//! telemetry straight to the [`TelemetryReporter`] and passes acknowledgements and decode failures
//! to the [`Transport`]. The transport is driven by the command queue's dispatcher and only ever
//! has one command outstanding.

use async_trait::async_trait;
use futures::{select, FutureExt};
use relay_protocol::{
    Body, ChannelReport, Command, Frame, FrameError, Sequence, TelemetrySample, FRAME_OVERHEAD,
    START_BYTE,
};
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use std::sync::Arc;

use crate::TaskAliveToken;
use crate::config::LinkConfig;
use crate::error::TransportError;
use crate::queue::CommandQueue;
use crate::serial::{Data, DeviceState};
use crate::telemetry::TelemetryReporter;

/// Something that can deliver a command to the controller and return its acknowledgement.
#[async_trait]
pub trait Link: Send {
    async fn request(&mut self, command: Command) -> Result<ChannelReport, TransportError>;
}

/// Room for acknowledgements the transport has not read yet. It empties the channel before every
/// command, and the controller answers each frame it receives at most once.
const ACK_CAPACITY: usize = 16;

/// An acknowledgement routed from the receive task to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub sequence: Sequence,
    pub report: ChannelReport,
}

/// The receive task's end of the route to the [`Transport`].
pub struct ReplySender {
    acks: mpsc::Sender<Ack>,
    /// Counts frames that failed to decode. The burst of errors left by one damaged frame is seen
    /// by the transport as a single change.
    corrupted: watch::Sender<u64>,
}

/// The [`Transport`]'s end: acknowledgements, and notice of frames that failed to decode.
pub struct Replies {
    acks: mpsc::Receiver<Ack>,
    corrupted: watch::Receiver<u64>,
}

/// Returns both ends of the route from the receive task to the transport.
pub fn replies() -> (ReplySender, Replies) {
    let (acks_tx, acks) = mpsc::channel(ACK_CAPACITY);
    let (corrupted_tx, corrupted) = watch::channel(0);

    (
        ReplySender {
            acks: acks_tx,
            corrupted: corrupted_tx,
        },
        Replies { acks, corrupted },
    )
}

impl ReplySender {
    fn ack(&self, ack: Ack) {
        match self.acks.try_send(ack) {
            Ok(()) => {}
            Err(TrySendError::Full(ack)) => {
                warn!(sequence = ack.sequence, "acknowledgement queue full, dropping acknowledgement");
            }
            // The dispatcher has already shut down
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn corrupted(&self) {
        self.corrupted.send_modify(|count| *count += 1);
    }
}

/// Reassembles frames from a chunked byte stream.
///
/// Bytes before a start byte are skipped. When a candidate frame fails to decode, only its start
/// byte is dropped and the search resumes from the next start byte, so a frame is either applied
/// whole or not at all.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns whether a partial frame is waiting for more bytes.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Returns the next complete frame, or the error that caused a candidate to be dropped, or
    /// `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        match self.buf.iter().position(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(skip) => {
                debug!(bytes = skip, "skipping bytes before start byte");
                self.buf.drain(..skip);
            }
            None => {
                if !self.buf.is_empty() {
                    debug!(bytes = self.buf.len(), "discarding bytes without a start byte");
                    self.buf.clear();
                }
                return None;
            }
        }

        let len = match Frame::peek_len(&self.buf) {
            Ok(Some(len)) if len <= self.buf.len() => len,
            Ok(_) => return None,
            Err(e) => {
                self.buf.drain(..1);
                return Some(Err(e));
            }
        };

        match Frame::decode(&self.buf[..len]) {
            Ok(frame) => {
                self.buf.drain(..len);
                Some(Ok(frame))
            }
            Err(e) => {
                self.buf.drain(..1);
                Some(Err(e))
            }
        }
    }

    /// Gives up on a partial frame after the link has fallen silent and returns anything that can
    /// still be recovered from the bytes behind it.
    pub fn flush_stalled(&mut self) -> Vec<Result<Frame, FrameError>> {
        let mut results = Vec::new();

        while !self.buf.is_empty() {
            let needed = Frame::peek_len(&self.buf)
                .ok()
                .flatten()
                .unwrap_or(FRAME_OVERHEAD);
            results.push(Err(FrameError::Truncated {
                needed,
                available: self.buf.len(),
            }));

            self.buf.drain(..1);
            while let Some(result) = self.next_frame() {
                results.push(result);
            }
        }

        results
    }
}

/// Reads the serial byte stream until it closes, routing every decoded frame.
pub async fn receive(
    mut rx: UnboundedReceiver<Data>,
    reporter: Arc<TelemetryReporter>,
    replies: ReplySender,
    config: LinkConfig,
    _task_alive_token: TaskAliveToken,
) {
    let mut reader = FrameReader::new();

    loop {
        let data = if reader.has_partial() {
            match time::timeout(config.inter_byte_timeout, rx.recv()).await {
                Ok(data) => data,
                Err(_) => {
                    for result in reader.flush_stalled() {
                        route(result, &reporter, &replies);
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        // The serial server has exited
        let Some(data) = data else {
            break;
        };

        reader.push(&data);
        while let Some(result) = reader.next_frame() {
            route(result, &reporter, &replies);
        }
    }

    debug!("serial receive task finished");
}

fn route(result: Result<Frame, FrameError>, reporter: &TelemetryReporter, replies: &ReplySender) {
    match result {
        Ok(Frame { sequence, body: Body::Telemetry(measurement) }) => {
            reporter.apply(TelemetrySample::new(measurement, sequence));
        }
        Ok(Frame { sequence, body: Body::Ack(report) }) => {
            replies.ack(Ack { sequence, report });
        }
        Ok(Frame { sequence, body: Body::Command(command) }) => {
            warn!(sequence, ?command, "ignoring command frame sent by the controller");
        }
        Err(e) => {
            debug!(error = %e, "dropped corrupt frame");
            replies.corrupted();
        }
    }
}

/// What ended one round of waiting for an acknowledgement.
enum Wait {
    Ack(Option<Ack>),
    /// A frame failed to decode, or `false` if the receive task has exited.
    Corrupted(bool),
    Elapsed,
}

/// Sends commands to the controller one at a time and waits for their acknowledgements.
pub struct Transport {
    /// Bytes to be written to the serial port.
    tx: UnboundedSender<Data>,
    device_state: watch::Receiver<DeviceState>,
    replies: Replies,
    next_sequence: Sequence,
    config: LinkConfig,
}

impl Transport {
    pub fn new(
        tx: UnboundedSender<Data>,
        device_state: watch::Receiver<DeviceState>,
        replies: Replies,
        config: LinkConfig,
    ) -> Self {
        Transport {
            tx,
            device_state,
            replies,
            next_sequence: 0,
            config,
        }
    }

    fn send(&self, frame: &Data) -> Result<(), TransportError> {
        self.tx
            .send(frame.clone())
            .map_err(|_| TransportError::Disconnected)
    }

    /// Waits for the acknowledgement of `sequence` for `command` until the ack timeout elapses.
    ///
    /// The first corrupt frame seen during the wait retransmits `frame` right away. The wait still
    /// ends at the same deadline, and later corrupt frames are ignored until the next attempt.
    async fn await_ack(
        &mut self,
        frame: &Data,
        command: &Command,
        sequence: Sequence,
    ) -> Result<Option<ChannelReport>, TransportError> {
        let deadline = Instant::now() + self.config.ack_timeout;
        let mut retransmitted = false;

        loop {
            let Replies { acks, corrupted } = &mut self.replies;
            let wait = select! {
                ack = acks.recv().fuse() => Wait::Ack(ack),
                changed = corrupted.changed().fuse() => Wait::Corrupted(changed.is_ok()),
                _ = time::sleep_until(deadline).fuse() => Wait::Elapsed,
            };

            match wait {
                Wait::Ack(Some(Ack { sequence: s, report }))
                    if s == sequence && report.channel == command.channel() =>
                {
                    return Ok(Some(report));
                }
                Wait::Ack(Some(Ack { sequence: s, .. })) => {
                    debug!(expected = sequence, received = s, "ignoring stale acknowledgement");
                }
                Wait::Corrupted(true) if !retransmitted => {
                    debug!(sequence, "corrupt frame during acknowledgement wait, retransmitting");
                    retransmitted = true;
                    self.send(frame)?;
                }
                Wait::Corrupted(true) => {}
                // The receive task has exited
                Wait::Ack(None) | Wait::Corrupted(false) => return Err(TransportError::Disconnected),
                Wait::Elapsed => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl Link for Transport {
    async fn request(&mut self, command: Command) -> Result<ChannelReport, TransportError> {
        if *self.device_state.borrow() == DeviceState::NotConnected {
            return Err(TransportError::Disconnected);
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let frame = relay_protocol::encode(command, sequence);

        // Anything still buffered belongs to an earlier exchange
        while self.replies.acks.try_recv().is_ok() {}

        for attempt in 1..=self.config.attempts {
            // Only corruption seen after this send may trigger a retransmit
            self.replies.corrupted.borrow_and_update();

            debug!(sequence, attempt, ?command, "sending command");
            self.send(&frame)?;

            if let Some(report) = self.await_ack(&frame, &command, sequence).await? {
                return Ok(report);
            }

            warn!(sequence, attempt, ?command, "no acknowledgement from controller");
        }

        Err(TransportError::Unreachable {
            attempts: self.config.attempts,
        })
    }
}

/// Watches the serial device. Losing it trips every closed channel; getting it back queues a
/// state query for both channels, since the controller may have restarted in the meantime.
pub async fn supervise_device(
    mut device_state: watch::Receiver<DeviceState>,
    reporter: Arc<TelemetryReporter>,
    queue: CommandQueue,
    task_alive_token: TaskAliveToken,
) {
    let mut last = *device_state.borrow_and_update();

    while device_state.changed().await.is_ok() {
        let state = *device_state.borrow_and_update();

        match (last, state) {
            (_, DeviceState::NotConnected) => reporter.link_lost(),
            (DeviceState::NotConnected, DeviceState::Connected) => {
                info!("serial device is back, resynchronizing channels");
                // Resynchronizing waits on the queue, which must not delay noticing another loss
                let queue = queue.clone();
                let token = task_alive_token.clone();
                tokio::spawn(async move {
                    queue.resync().await;
                    drop(token);
                });
            }
            _ => {}
        }

        last = state;
    }
}
