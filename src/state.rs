//! The per-channel relay and threshold state machine.
//!
//! The controller owns the physical relays; this is the gateway's authoritative record of them. A
//! record changes only when an acknowledgement arrives, when telemetry shows a sustained
//! overcurrent, or when the serial device is lost while a relay is closed.

use relay_protocol::{ChannelId, ChannelReport, Command, RelayState, Sequence, Switch, TelemetrySample};
use serde::Serialize;
use tracing::{info, warn};

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::CommandError;

/// The terminal outcome of a submitted command.
pub type Outcome = Result<ChannelSnapshot, CommandError>;

/// Why a channel was tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    OverCurrent,
    TransportFault,
}

/// A point-in-time copy of a channel's record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    pub state: RelayState,
    pub threshold_ma: u32,
    pub last_current_ma: Option<u32>,
    pub last_power_mw: Option<u32>,
    pub trip_reason: Option<TripReason>,
}

/// What to do with a command that reached the head of the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Plan {
    /// Resolved locally; nothing is sent to the controller.
    Resolved(Outcome),
    /// Send to the controller and apply its acknowledgement.
    Dispatch,
}

/// The result of applying a telemetry sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Not newer than the last applied sample; discarded.
    Stale,
    Applied,
    /// Applied, and it completed a run of over-threshold samples.
    Tripped,
}

/// Returns whether `sequence` comes after `last` in 16-bit serial number arithmetic.
fn is_newer(sequence: Sequence, last: Sequence) -> bool {
    let distance = sequence.wrapping_sub(last);
    distance != 0 && distance < 0x8000
}

/// The record for one relay channel.
#[derive(Debug)]
pub struct RelayChannel {
    id: ChannelId,
    state: RelayState,
    threshold_ma: u32,
    last_current_ma: Option<u32>,
    last_power_mw: Option<u32>,
    trip_reason: Option<TripReason>,
    /// Sequence number of the last applied sample, since the link was last established.
    last_sequence: Option<Sequence>,
    /// Currents of the most recent samples since the last state change, oldest first.
    window: VecDeque<u32>,
    trip_samples: usize,
}

impl RelayChannel {
    /// Returns a channel in the `Off` state.
    pub fn new(id: ChannelId, threshold_ma: u32, trip_samples: usize) -> Self {
        RelayChannel {
            id,
            state: RelayState::Off,
            threshold_ma,
            last_current_ma: None,
            last_power_mw: None,
            trip_reason: None,
            last_sequence: None,
            window: VecDeque::with_capacity(trip_samples),
            trip_samples,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn threshold_ma(&self) -> u32 {
        self.threshold_ma
    }

    pub fn trip_reason(&self) -> Option<TripReason> {
        self.trip_reason
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel: self.id,
            state: self.state,
            threshold_ma: self.threshold_ma,
            last_current_ma: self.last_current_ma,
            last_power_mw: self.last_power_mw,
            trip_reason: self.trip_reason,
        }
    }

    /// Decides whether `command` must go to the controller.
    ///
    /// Closing a relay that is already closed is a no-op, and closing one while the latest sample
    /// is above the threshold is refused. A tripped channel is only judged on samples taken since
    /// the trip, so it can be restored explicitly. Opening a relay that tripped on overcurrent is
    /// resolved locally because the controller already opened it.
    pub fn plan(&mut self, command: &Command) -> Plan {
        match *command {
            Command::SetRelay { desired: Switch::On, .. } => {
                let latest_ma = match self.state {
                    RelayState::On => return Plan::Resolved(Ok(self.snapshot())),
                    RelayState::Tripped => self.window.back().copied(),
                    RelayState::Off => self.last_current_ma,
                };

                match latest_ma {
                    Some(current_ma) if current_ma > self.threshold_ma => {
                        Plan::Resolved(Err(CommandError::OverCurrentInterlock {
                            channel: self.id,
                            current_ma,
                            threshold_ma: self.threshold_ma,
                        }))
                    }
                    _ => Plan::Dispatch,
                }
            }
            Command::SetRelay { desired: Switch::Off, .. }
                if self.trip_reason == Some(TripReason::OverCurrent) =>
            {
                self.set_state(RelayState::Off);
                Plan::Resolved(Ok(self.snapshot()))
            }
            _ => Plan::Dispatch,
        }
    }

    /// Applies the state reported in an acknowledgement.
    pub fn apply_report(&mut self, report: &ChannelReport) {
        if report.threshold_ma > 0 {
            self.threshold_ma = report.threshold_ma;
        } else {
            warn!(channel = %self.id, "controller reported a zero threshold; keeping {}", self.threshold_ma);
        }

        match report.state {
            RelayState::Tripped => {
                if self.state != RelayState::Tripped {
                    self.trip(TripReason::OverCurrent);
                }
            }
            state => self.set_state(state),
        }
    }

    /// Applies a telemetry sample. Measurements are recorded in every state; trips are only
    /// evaluated while the relay is closed.
    pub fn apply_sample(&mut self, sample: &TelemetrySample) -> SampleOutcome {
        if let Some(last) = self.last_sequence {
            if !is_newer(sample.sequence, last) {
                return SampleOutcome::Stale;
            }
        }

        self.last_sequence = Some(sample.sequence);
        self.last_current_ma = Some(sample.current_ma);
        self.last_power_mw = Some(sample.power_mw);

        if self.window.len() == self.trip_samples {
            self.window.pop_front();
        }
        self.window.push_back(sample.current_ma);

        let sustained = self.window.len() == self.trip_samples
            && self.window.iter().all(|&current| current > self.threshold_ma);

        if self.state == RelayState::On && sustained {
            self.trip(TripReason::OverCurrent);
            SampleOutcome::Tripped
        } else {
            SampleOutcome::Applied
        }
    }

    /// Handles losing the link to the controller. A closed channel is tripped, and the telemetry
    /// watermark is forgotten because the controller numbers its samples from zero again after a
    /// restart. Returns whether the channel was closed and is now tripped.
    pub fn link_lost(&mut self) -> bool {
        self.last_sequence = None;
        self.window.clear();

        if self.state == RelayState::On {
            self.trip(TripReason::TransportFault);
            true
        } else {
            false
        }
    }

    fn trip(&mut self, reason: TripReason) {
        self.state = RelayState::Tripped;
        self.trip_reason = Some(reason);
        self.window.clear();
    }

    fn set_state(&mut self, state: RelayState) {
        if state == self.state {
            return;
        }

        info!(channel = %self.id, from = %self.state, to = %state, "channel state changed");
        self.state = state;
        self.trip_reason = None;
        self.window.clear();
    }
}

/// The records of both channels. Each channel has its own lock, so work on one never waits for
/// the other.
#[derive(Debug)]
pub struct ChannelTable {
    channels: [Mutex<RelayChannel>; 2],
}

impl ChannelTable {
    pub fn new(threshold_ma: u32, trip_samples: usize) -> Self {
        ChannelTable {
            channels: ChannelId::ALL
                .map(|id| Mutex::new(RelayChannel::new(id, threshold_ma, trip_samples))),
        }
    }

    /// Locks the record of `channel`. The guard must not be held across an `await`.
    pub fn lock(&self, channel: ChannelId) -> MutexGuard<'_, RelayChannel> {
        self.channels[channel.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, channel: ChannelId) -> ChannelSnapshot {
        self.lock(channel).snapshot()
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        ChannelId::ALL.iter().map(|&id| self.snapshot(id)).collect()
    }
}
