//! Application of controller telemetry to the channel table.

use relay_protocol::{ChannelId, TelemetrySample};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use std::sync::Arc;

use crate::state::{ChannelTable, SampleOutcome, TripReason};

/// Events published to live measurement subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    Sample(TelemetrySample),
    Trip {
        channel: ChannelId,
        reason: TripReason,
    },
    /// The gateway is shutting down; no more events follow.
    Shutdown,
}

/// Applies samples to the channel table outside of the command queue and fans them out to
/// subscribers.
pub struct TelemetryReporter {
    table: Arc<ChannelTable>,
    events: broadcast::Sender<FeedEvent>,
}

impl TelemetryReporter {
    /// Returns a reporter that keeps up to `capacity` unread events per subscriber.
    pub fn new(table: Arc<ChannelTable>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);

        TelemetryReporter { table, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Records `sample` on its channel and evaluates the overcurrent trip.
    pub fn apply(&self, sample: TelemetrySample) -> SampleOutcome {
        let (outcome, threshold_ma) = {
            let mut channel = self.table.lock(sample.channel);
            (channel.apply_sample(&sample), channel.threshold_ma())
        };

        match outcome {
            SampleOutcome::Stale => {
                debug!(channel = %sample.channel, sequence = sample.sequence, "discarding stale sample");
            }
            SampleOutcome::Applied => self.publish(FeedEvent::Sample(sample)),
            SampleOutcome::Tripped => {
                warn!(
                    channel = %sample.channel,
                    current_ma = sample.current_ma,
                    threshold_ma,
                    "channel tripped on overcurrent",
                );
                self.publish(FeedEvent::Sample(sample));
                self.publish(FeedEvent::Trip {
                    channel: sample.channel,
                    reason: TripReason::OverCurrent,
                });
            }
        }

        outcome
    }

    /// Trips every closed channel after the link to the controller was lost, and forgets the
    /// sample numbering of both.
    pub fn link_lost(&self) {
        for channel in ChannelId::ALL {
            let tripped = self.table.lock(channel).link_lost();

            if tripped {
                warn!(%channel, "channel tripped on transport fault");
                self.publish(FeedEvent::Trip {
                    channel,
                    reason: TripReason::TransportFault,
                });
            }
        }
    }

    pub fn shutdown(&self) {
        self.publish(FeedEvent::Shutdown);
    }

    fn publish(&self, event: FeedEvent) {
        // Fails only when nobody is subscribed
        let _ = self.events.send(event);
    }
}
