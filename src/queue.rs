//! The command queue. See [`CommandQueue`] and [`Dispatcher`].

use futures::{select, FutureExt};
use relay_protocol::{ChannelId, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use std::sync::Arc;

use crate::TaskAliveToken;
use crate::error::CommandError;
use crate::link::Link;
use crate::state::{ChannelTable, Outcome, Plan};

/// A command waiting to be served, and the ticket its outcome is delivered on.
pub struct Submission {
    command: Command,
    ticket: oneshot::Sender<Outcome>,
}

/// The producer side of the command queue. Cheap to clone; every HTTP handler holds one.
///
/// Commands are served strictly in the order they were enqueued, one at a time, and each resolves
/// to exactly one [`Outcome`].
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Submission>,
}

impl CommandQueue {
    /// Returns a queue holding at most `capacity` waiting commands, and the receiver to hand to a
    /// [`Dispatcher`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (CommandQueue { tx }, rx)
    }

    /// Adds `command` to the back of the queue, waiting for room if it is full, and returns a
    /// receiver for its outcome.
    pub async fn enqueue(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<Outcome>, CommandError> {
        let (ticket, outcome) = oneshot::channel();

        self.tx
            .send(Submission { command, ticket })
            .await
            .map_err(|_| CommandError::ShuttingDown)?;

        Ok(outcome)
    }

    /// Submits `command` and waits for its outcome.
    pub async fn submit(&self, command: Command) -> Outcome {
        let outcome = self.enqueue(command).await?;

        // The dispatcher always answers a ticket it took; a dropped ticket means it was torn down
        outcome.await.unwrap_or(Err(CommandError::ShuttingDown))
    }

    /// Queries both channels through the queue, behind anything already waiting.
    pub async fn resync(&self) {
        for channel in ChannelId::ALL {
            let outcome = self.submit(Command::QueryState { channel }).await;
            log_resync(channel, &outcome);
        }
    }
}

fn log_resync(channel: ChannelId, outcome: &Outcome) {
    match outcome {
        Ok(snapshot) => info!(
            %channel,
            state = %snapshot.state,
            threshold_ma = snapshot.threshold_ma,
            "resynchronized channel",
        ),
        Err(e) => warn!(%channel, error = %e, "could not resynchronize channel"),
    }
}

/// The single consumer of the command queue. Owns the link, so at most one command is ever on
/// the wire.
pub struct Dispatcher<L> {
    submissions: mpsc::Receiver<Submission>,
    link: L,
    table: Arc<ChannelTable>,
    terminate_rx: watch::Receiver<()>,
}

impl<L: Link> Dispatcher<L> {
    pub fn new(
        submissions: mpsc::Receiver<Submission>,
        link: L,
        table: Arc<ChannelTable>,
        terminate_rx: watch::Receiver<()>,
    ) -> Self {
        Dispatcher {
            submissions,
            link,
            table,
            terminate_rx,
        }
    }

    /// Resynchronizes with the controller, then serves commands until termination. Commands still
    /// waiting at termination resolve to [`CommandError::ShuttingDown`].
    pub async fn run(mut self, _task_alive_token: TaskAliveToken) {
        self.resync().await;

        loop {
            // A command that was already taken is always served to completion
            let submission = select! {
                s = self.submissions.recv().fuse() => s,
                _ = self.terminate_rx.changed().fuse() => None,
            };

            let Some(Submission { command, ticket }) = submission else {
                break;
            };

            let outcome = self.serve(command).await;
            // The submitter may have stopped waiting
            let _ = ticket.send(outcome);
        }

        self.submissions.close();
        while let Ok(Submission { ticket, .. }) = self.submissions.try_recv() {
            let _ = ticket.send(Err(CommandError::ShuttingDown));
        }

        debug!("command dispatcher finished");
    }

    /// Queries both channels so the table reflects the controller before any command is served.
    async fn resync(&mut self) {
        for channel in ChannelId::ALL {
            let outcome = self.serve(Command::QueryState { channel }).await;
            log_resync(channel, &outcome);
        }
    }

    async fn serve(&mut self, command: Command) -> Outcome {
        let channel = command.channel();
        let plan = self.table.lock(channel).plan(&command);

        match plan {
            Plan::Resolved(outcome) => {
                debug!(?command, ?outcome, "resolved without the controller");
                outcome
            }
            Plan::Dispatch => {
                let report = self.link.request(command).await.map_err(|e| {
                    warn!(?command, error = %e, "command failed");
                    e
                })?;

                let mut record = self.table.lock(channel);
                record.apply_report(&report);
                Ok(record.snapshot())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::channel::mpsc as futures_mpsc;
    use relay_protocol::{ChannelReport, RelayState, Switch};

    use std::sync::Mutex;

    use super::*;
    use crate::error::TransportError;
    use crate::state::TripReason;

    /// A link that answers like a controller would, records every command it was asked to send
    /// and, when it sees `watch_for`, whether the first outcome had been delivered by then.
    struct FakeLink {
        sent: Arc<Mutex<Vec<Command>>>,
        reachable: bool,
        states: [RelayState; 2],
        thresholds: [u32; 2],
        watch_for: Option<Command>,
        first_outcome: Arc<Mutex<Option<oneshot::Receiver<Outcome>>>>,
        first_delivered: Arc<Mutex<Option<bool>>>,
    }

    impl FakeLink {
        fn new(sent: Arc<Mutex<Vec<Command>>>) -> Self {
            FakeLink {
                sent,
                reachable: true,
                states: [RelayState::Off; 2],
                thresholds: [2500; 2],
                watch_for: None,
                first_outcome: Arc::new(Mutex::new(None)),
                first_delivered: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl Link for FakeLink {
        async fn request(&mut self, command: Command) -> Result<ChannelReport, TransportError> {
            self.sent.lock().unwrap().push(command);

            if Some(command) == self.watch_for {
                let delivered = self
                    .first_outcome
                    .lock()
                    .unwrap()
                    .as_mut()
                    .map(|rx| rx.try_recv().is_ok());
                *self.first_delivered.lock().unwrap() = delivered;
            }

            if !self.reachable {
                return Err(TransportError::Unreachable { attempts: 3 });
            }

            let i = command.channel().index();
            match command {
                Command::SetRelay { desired: Switch::On, .. } => self.states[i] = RelayState::On,
                Command::SetRelay { desired: Switch::Off, .. } => self.states[i] = RelayState::Off,
                Command::SetThreshold { threshold_ma, .. } => self.thresholds[i] = threshold_ma,
                Command::QueryState { .. } => {}
            }

            Ok(ChannelReport {
                channel: command.channel(),
                state: self.states[i],
                threshold_ma: self.thresholds[i],
            })
        }
    }

    struct Setup {
        queue: CommandQueue,
        dispatcher: Dispatcher<FakeLink>,
        table: Arc<ChannelTable>,
        sent: Arc<Mutex<Vec<Command>>>,
        terminate_tx: watch::Sender<()>,
    }

    fn setup(link: impl FnOnce(&mut FakeLink)) -> Setup {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut fake = FakeLink::new(sent.clone());
        link(&mut fake);

        let table = Arc::new(ChannelTable::new(2500, 3));
        let (queue, submissions) = CommandQueue::new(8);
        let (terminate_tx, terminate_rx) = watch::channel(());
        let dispatcher = Dispatcher::new(submissions, fake, table.clone(), terminate_rx);

        Setup {
            queue,
            dispatcher,
            table,
            sent,
            terminate_tx,
        }
    }

    fn token() -> TaskAliveToken {
        TaskAliveToken(futures_mpsc::channel(1).0)
    }

    fn relay(channel: ChannelId, desired: Switch) -> Command {
        Command::SetRelay { channel, desired }
    }

    #[tokio::test]
    async fn test_resync_before_serving() {
        let s = setup(|link| {
            link.states[1] = RelayState::On;
            link.thresholds[1] = 1800;
        });
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        let outcome = queue.submit(relay(ChannelId::One, Switch::On)).await.unwrap();
        assert_eq!(RelayState::On, outcome.state);

        assert_eq!(
            vec![
                Command::QueryState { channel: ChannelId::One },
                Command::QueryState { channel: ChannelId::Two },
                relay(ChannelId::One, Switch::On),
            ],
            *s.sent.lock().unwrap(),
        );
        let two = s.table.snapshot(ChannelId::Two);
        assert_eq!(RelayState::On, two.state);
        assert_eq!(1800, two.threshold_ma);
    }

    #[tokio::test]
    async fn test_outcome_delivered_before_next_dispatch() {
        let first = relay(ChannelId::One, Switch::On);
        let second = Command::SetThreshold { channel: ChannelId::Two, threshold_ma: 900 };

        let s = setup(|link| link.watch_for = Some(second));
        let first_outcome = s.dispatcher.link.first_outcome.clone();
        let first_delivered = s.dispatcher.link.first_delivered.clone();

        // Both commands are waiting before the dispatcher starts
        *first_outcome.lock().unwrap() = Some(s.queue.enqueue(first).await.unwrap());
        let second_outcome = s.queue.enqueue(second).await.unwrap();
        tokio::spawn(s.dispatcher.run(token()));

        assert_eq!(900, second_outcome.await.unwrap().unwrap().threshold_ma);
        assert_eq!(Some(true), *first_delivered.lock().unwrap());

        let sent = s.sent.lock().unwrap();
        assert_eq!(&[first, second][..], &sent[2..]);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let s = setup(|_| {});
        let commands = [
            relay(ChannelId::Two, Switch::On),
            Command::SetThreshold { channel: ChannelId::One, threshold_ma: 100 },
            relay(ChannelId::Two, Switch::Off),
            Command::SetThreshold { channel: ChannelId::One, threshold_ma: 200 },
        ];

        let mut outcomes = Vec::new();
        for command in commands {
            outcomes.push(s.queue.enqueue(command).await.unwrap());
        }
        tokio::spawn(s.dispatcher.run(token()));

        for outcome in outcomes {
            assert!(outcome.await.unwrap().is_ok());
        }

        assert_eq!(&commands[..], &s.sent.lock().unwrap()[2..]);
        assert_eq!(200, s.table.snapshot(ChannelId::One).threshold_ma);
        assert_eq!(RelayState::Off, s.table.snapshot(ChannelId::Two).state);
    }

    #[tokio::test]
    async fn test_idempotent_switch_on() {
        let s = setup(|_| {});
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        for _ in 0..2 {
            let outcome = queue.submit(relay(ChannelId::One, Switch::On)).await.unwrap();
            assert_eq!(RelayState::On, outcome.state);
        }

        let sent = s.sent.lock().unwrap();
        assert_eq!(1, sent.iter().filter(|c| matches!(c, Command::SetRelay { .. })).count());
    }

    #[tokio::test]
    async fn test_unreachable_leaves_state() {
        let s = setup(|link| link.reachable = false);
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        let before = s.table.snapshot(ChannelId::Two);
        assert_eq!(
            Err(CommandError::Transport(TransportError::Unreachable { attempts: 3 })),
            queue.submit(relay(ChannelId::Two, Switch::On)).await,
        );
        assert_eq!(before, s.table.snapshot(ChannelId::Two));
    }

    #[tokio::test]
    async fn test_interlock_never_dispatched() {
        let s = setup(|_| {});
        s.table.lock(ChannelId::One).apply_sample(&relay_protocol::TelemetrySample {
            channel: ChannelId::One,
            current_ma: 4000,
            power_mw: 0,
            sequence: 0,
        });
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        assert!(matches!(
            queue.submit(relay(ChannelId::One, Switch::On)).await,
            Err(CommandError::OverCurrentInterlock { current_ma: 4000, threshold_ma: 2500, .. }),
        ));
        assert!(!s.sent.lock().unwrap().iter().any(|c| matches!(c, Command::SetRelay { .. })));
        assert_eq!(RelayState::Off, s.table.snapshot(ChannelId::One).state);
    }

    #[tokio::test]
    async fn test_switch_off_after_trip() {
        let s = setup(|_| {});
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        queue.submit(relay(ChannelId::One, Switch::On)).await.unwrap();
        for sequence in 0..3 {
            s.table.lock(ChannelId::One).apply_sample(&relay_protocol::TelemetrySample {
                channel: ChannelId::One,
                current_ma: 2600,
                power_mw: 0,
                sequence,
            });
        }
        assert_eq!(Some(TripReason::OverCurrent), s.table.snapshot(ChannelId::One).trip_reason);

        let outcome = queue.submit(relay(ChannelId::One, Switch::Off)).await.unwrap();
        assert_eq!(RelayState::Off, outcome.state);
        // The relay was already open, so nothing was sent
        assert_eq!(1, s.sent.lock().unwrap().iter().filter(|c| matches!(c, Command::SetRelay { .. })).count());
    }

    #[tokio::test]
    async fn test_resync_through_queue() {
        let s = setup(|_| {});
        let queue = s.queue.clone();
        tokio::spawn(s.dispatcher.run(token()));

        queue.submit(relay(ChannelId::Two, Switch::On)).await.unwrap();
        queue.resync().await;

        let sent = s.sent.lock().unwrap();
        assert_eq!(
            &[
                relay(ChannelId::Two, Switch::On),
                Command::QueryState { channel: ChannelId::One },
                Command::QueryState { channel: ChannelId::Two },
            ][..],
            &sent[2..],
        );
    }

    #[tokio::test]
    async fn test_waiting_commands_resolved_on_shutdown() {
        let s = setup(|_| {});
        let pending = s.queue.enqueue(relay(ChannelId::One, Switch::On)).await.unwrap();

        // Terminate before the dispatcher ever runs
        s.terminate_tx.send(()).unwrap();
        s.dispatcher.run(token()).await;

        // Served or refused, but never dropped
        assert!(pending.await.is_ok());
        assert_eq!(Err(CommandError::ShuttingDown), s.queue.submit(relay(ChannelId::Two, Switch::On)).await);
    }
}
