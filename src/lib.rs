//! An HTTP gateway for a two-channel relay and overcurrent controller attached over a serial link.
//!
//! Relay and threshold commands arrive over HTTP, are served one at a time by the command queue
//! and are delivered to the controller with acknowledgement and retry. Telemetry pushed by the
//! controller updates the channel records and trips channels that stay above their threshold.

pub mod config;
pub mod error;
mod feed;
mod http;
pub mod link;
pub mod queue;
pub mod serial;
pub mod state;
pub mod telemetry;

use futures::channel::mpsc;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::LaunchError;
use crate::link::Transport;
use crate::queue::{CommandQueue, Dispatcher};
use crate::serial::{Client, OpenPort, Server};
use crate::state::{ChannelSnapshot, ChannelTable};
use crate::telemetry::TelemetryReporter;

/// Unread events each live feed subscriber may fall behind by before it skips some.
const FEED_CAPACITY: usize = 64;

/// A token that signals that a `tokio` task is still alive as long as it has not been dropped.
#[derive(Clone)]
pub struct TaskAliveToken(mpsc::Sender<()>);

/// State shared by every request handler.
pub struct Gateway {
    table: Arc<ChannelTable>,
    queue: CommandQueue,
    reporter: Arc<TelemetryReporter>,
}

impl Gateway {
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.table.snapshots()
    }
}

/// A handle to a running gateway.
pub struct GatewayHandle {
    ctrlc_tx: watch::Sender<()>,
    http_addr: SocketAddr,
    feed_addr: SocketAddr,
    gateway: Arc<Gateway>,
}

impl GatewayHandle {
    /// The address the HTTP control surface is listening on.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The address the live feed is listening on.
    pub fn feed_addr(&self) -> SocketAddr {
        self.feed_addr
    }

    /// Starts shutting the gateway down. The launch task finishes once everything has stopped.
    pub fn terminate(self) {
        self.gateway.reporter.shutdown();
        // Fails only if every receiver is already gone
        let _ = self.ctrlc_tx.send(());
    }
}

/// Launches the gateway for `config` and runs it until ctrl-c is received.
pub async fn launch(config: GatewayConfig) -> Result<(), LaunchError> {
    let (gateway_task, handle) =
        launch_with_port_open_fn(config, serial::open_serial_port).await?;

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to wait for ctrl-c signal");
    }
    handle.terminate();

    if let Err(e) = gateway_task.await {
        error!(error = %e, "gateway task failed");
    }

    Ok(())
}

/// Like [`launch`], but opens the serial port by calling `port_open_fn` and returns as soon as
/// the gateway is listening.
///
/// Returns the task to await for the gateway to finish, and a handle to terminate it.
pub async fn launch_with_port_open_fn<F: OpenPort + 'static>(
    config: GatewayConfig,
    port_open_fn: F,
) -> Result<(JoinHandle<()>, GatewayHandle), LaunchError> {
    config.validate()?;

    let http_listener = bind(config.http_addr).await?;
    let feed_listener = bind(config.feed_addr).await?;
    let http_addr = http_listener.local_addr().map_err(LaunchError::LocalAddr)?;
    let feed_addr = feed_listener.local_addr().map_err(LaunchError::LocalAddr)?;

    info!(
        %http_addr,
        %feed_addr,
        serial_port = %config.serial_port.display(),
        "gateway listening",
    );

    // Set up channel to wait for all tasks to finish
    let (task_alive_token, mut tasks_finished_listener) = mpsc::channel(1);
    let task_alive_token = TaskAliveToken(task_alive_token);

    let (ctrlc_tx, ctrlc_rx) = watch::channel(());

    let (serial_server, serial_client, error) =
        Server::with_port_open_fn(config.serial_port.clone(), port_open_fn, ctrlc_rx.clone());
    if let Err(e) = error {
        warn!(error = %e, "failed to open serial port, retrying in the background");
    }
    let server_handle = serial_server.spawn();

    let Client {
        tx: serial_tx,
        rx: serial_rx,
        device_state,
    } = serial_client;

    let table = Arc::new(ChannelTable::new(
        config.default_threshold_ma,
        config.trip_samples,
    ));
    let reporter = Arc::new(TelemetryReporter::new(table.clone(), FEED_CAPACITY));
    let (queue, submissions) = CommandQueue::new(config.queue_capacity);
    let (reply_tx, replies) = link::replies();

    tokio::spawn(link::receive(
        serial_rx,
        reporter.clone(),
        reply_tx,
        config.link,
        task_alive_token.clone(),
    ));
    tokio::spawn(link::supervise_device(
        device_state.clone(),
        reporter.clone(),
        queue.clone(),
        task_alive_token.clone(),
    ));

    let transport = Transport::new(serial_tx, device_state, replies, config.link);
    let dispatcher = Dispatcher::new(submissions, transport, table.clone(), ctrlc_rx.clone());
    tokio::spawn(dispatcher.run(task_alive_token.clone()));

    tokio::spawn(feed::serve(
        feed_listener,
        reporter.clone(),
        ctrlc_rx.clone(),
        task_alive_token.clone(),
    ));

    let gateway = Arc::new(Gateway {
        table,
        queue,
        reporter,
    });

    let router = http::router(gateway.clone());
    let mut http_ctrlc_rx = ctrlc_rx;
    let http_token = task_alive_token.clone();
    tokio::spawn(async move {
        let serve = axum::serve(http_listener, router).with_graceful_shutdown(async move {
            let _ = http_ctrlc_rx.changed().await;
        });

        if let Err(e) = serve.await {
            error!(error = %e, "HTTP server exited with error");
        }
        drop(http_token);
    });

    let gateway_task = tokio::spawn(async move {
        // Only the tasks may keep the listener open
        drop(task_alive_token);
        // This will return `None` when all `Sender`s (owned by the tasks) have been dropped
        tasks_finished_listener.next().await;

        // Wait for the serial I/O server to exit
        match task::spawn_blocking(move || server_handle.join()).await {
            Ok(Ok(())) => {}
            _ => error!("serial I/O server did not shut down cleanly"),
        }

        info!("gateway shut down");
    });

    let handle = GatewayHandle {
        ctrlc_tx,
        http_addr,
        feed_addr,
        gateway,
    };

    Ok((gateway_task, handle))
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, LaunchError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| LaunchError::Bind { addr, source })
}
