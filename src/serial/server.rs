//! A server for serial port communication.

use serialport::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use super::port::{OpenPort, Port};
use super::{Client, Data, DeviceState};

/// The delay between attempts to reopen the serial port after it closed.
const PORT_OPEN_ATTEMPT_DELAY: Duration = Duration::from_secs(2);

/// How long the loop sleeps when the port is unavailable or there was nothing to do.
const IDLE_DELAY: Duration = Duration::from_millis(1);

enum SerialPortState {
    /// The serial port is open and has a device connected to it.
    Accessible,
    /// The serial port is closed or has no device connected to it.
    Inaccessible {
        /// The time after which to try accessing the serial port again.
        retry_at: Instant,
    },
}

impl SerialPortState {
    fn inaccessible() -> Self {
        SerialPortState::Inaccessible {
            retry_at: Instant::now() + PORT_OPEN_ATTEMPT_DELAY,
        }
    }
}

/// A server that directly communicates with a serial port, forwarding data to and from a
/// [`Client`] and handling serial device disconnections and reconnections.
pub struct Server {
    port: Port,
    port_state: SerialPortState,
    /// Notifies the client of serial device disconnections and reconnections.
    device_state_tx: Sender<DeviceState>,
    read_buf: Vec<u8>,
    /// Partially written data, to be completed before anything else is written.
    data_to_write: Option<Data>,
    /// Data to be written to the serial port.
    rx: UnboundedReceiver<Data>,
    /// Data read from the serial port.
    tx: UnboundedSender<Data>,
    terminate_rx: Receiver<()>,
}

impl Server {
    /// Returns a new `Server`, [`Client`], and an error if the serial port at `path` could not be
    /// opened.
    ///
    /// The server keeps retrying to open the serial port even if it fails initially. It exits when
    /// `terminate_rx` signals that the gateway is shutting down.
    pub fn new(path: PathBuf, terminate_rx: Receiver<()>) -> (Self, Client, Result<(), Error>) {
        Server::with_port_open_fn(path, super::open_serial_port, terminate_rx)
    }

    /// Like [`new`][Self::new], but opens the serial port by calling `port_open_fn`.
    pub fn with_port_open_fn<F: OpenPort + 'static>(
        path: PathBuf,
        port_open_fn: F,
        terminate_rx: Receiver<()>,
    ) -> (Self, Client, Result<(), Error>) {
        let (port, error) = Port::with_open_fn(path, port_open_fn);

        let (initial_state, port_state) = match error {
            Ok(_) => (DeviceState::Connected, SerialPortState::Accessible),
            Err(_) => (DeviceState::NotConnected, SerialPortState::inaccessible()),
        };

        let (device_state_tx, device_state_rx) = watch::channel(initial_state);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let server = Server {
            port,
            port_state,
            device_state_tx,
            read_buf: vec![0; 256],
            data_to_write: None,
            rx: write_rx,
            tx: read_tx,
            terminate_rx,
        };

        let client = Client::new(write_tx, read_rx, device_state_rx);

        (server, client, error)
    }

    /// Runs the server loop on a dedicated thread until termination is signalled.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Runs the serial port communication server loop.
    ///
    /// This blocks, so a separate thread must be used for it.
    pub fn run(mut self) {
        info!(path = %self.port.path().display(), "serial I/O server started");

        loop {
            if self.terminate_rx.has_changed().unwrap_or(true) {
                break;
            }

            let busy = match self.port_state {
                SerialPortState::Accessible => match self.process_io() {
                    Ok(busy) => busy,
                    Err(e) => {
                        self.on_device_disconnected(e);
                        false
                    }
                },
                SerialPortState::Inaccessible { ref mut retry_at } => {
                    let now = Instant::now();

                    if now >= *retry_at {
                        match self.port.try_open() {
                            Ok(_) => self.on_device_connected(),
                            Err(e) => {
                                debug!(error = %e, "serial port still unavailable");
                                *retry_at = now + PORT_OPEN_ATTEMPT_DELAY;
                            }
                        }
                    }
                    false
                }
            };

            if !busy {
                thread::sleep(IDLE_DELAY);
            }
        }

        info!("serial I/O server stopped");
    }

    fn on_device_disconnected(&mut self, error: Error) {
        warn!(%error, "serial device disconnected");
        self.port_state = SerialPortState::inaccessible();
        self.device_state_tx.send_replace(DeviceState::NotConnected);
    }

    fn on_device_connected(&mut self) {
        info!("serial device connected");
        self.port_state = SerialPortState::Accessible;
        self.device_state_tx.send_replace(DeviceState::Connected);
    }

    /// Processes serial port and [`Client`] I/O. Returns whether any bytes moved, or `Err` if the
    /// serial port could not be accessed.
    fn process_io(&mut self) -> Result<bool, Error> {
        let mut busy = false;

        // Data that previously failed to write goes first
        if self.data_to_write.is_none() {
            self.data_to_write = match self.rx.try_recv() {
                Ok(data) => Some(data),
                // The client is gone, which only happens during shutdown
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }

        if let Some(ref data) = self.data_to_write {
            match write(&mut self.port, data) {
                Ok(remaining) => {
                    self.data_to_write = remaining;
                    busy = true;
                }
                Err(e) if is_temporary(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self.port.read(&mut self.read_buf) {
            Ok(0) => {}
            Ok(bytes) => {
                // Nobody is listening any more once the receive task has finished
                let _ = self.tx.send(self.read_buf[..bytes].to_vec());
                busy = true;
            }
            Err(e) if is_temporary(&e) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(busy)
    }
}

fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// Writes `data` to `out`. Returns `Ok(None)` if all the data was successfully written, or
/// `Ok(Some)` with the remaining data otherwise.
fn write<F: Write>(mut out: F, data: &[u8]) -> Result<Option<Data>, io::Error> {
    let bytes = out.write(data)?;

    if bytes < data.len() {
        Ok(Some(data[bytes..].to_vec()))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use mock::controller::SimulatedController;
    use relay_protocol::{ChannelId, Command, Frame, Switch};

    use super::*;

    #[test]
    fn test_write() {
        let mut buf = vec![0; 4];
        let data = vec![1, 2, 3, 4];
        // All the data was written
        assert_eq!(None, write(&mut buf[..], &data).unwrap());

        let mut buf = vec![0; 3];
        let data = vec![1, 2, 3, 4];
        // Remaining data is returned
        assert_eq!(Some(vec![4]), write(&mut buf[..], &data).unwrap());
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let controller = SimulatedController::new();
        let (terminate_tx, terminate_rx) = watch::channel(());
        let (server, mut client, error) =
            Server::with_port_open_fn("fakeport".into(), controller.open_fn(), terminate_rx);
        assert!(error.is_ok());
        assert_eq!(DeviceState::Connected, *client.device_state.borrow());

        let handle = server.spawn();

        let command = Command::QueryState {
            channel: ChannelId::Two,
        };
        client.tx.send(relay_protocol::encode(command, 3)).unwrap();

        let data = client.rx.recv().await.unwrap();
        assert_eq!(3, Frame::decode(&data).unwrap().sequence);
        assert_eq!(vec![(3, command)], controller.commands());

        terminate_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_signalled() {
        let controller = SimulatedController::new();
        let (terminate_tx, terminate_rx) = watch::channel(());
        let (server, mut client, _) =
            Server::with_port_open_fn("fakeport".into(), controller.open_fn(), terminate_rx);
        let handle = server.spawn();

        controller.set_has_error(true);
        client.device_state.changed().await.unwrap();
        assert_eq!(DeviceState::NotConnected, *client.device_state.borrow());

        // Nothing written while the device is gone reaches it
        let command = Command::SetRelay {
            channel: ChannelId::One,
            desired: Switch::On,
        };
        client.tx.send(relay_protocol::encode(command, 0)).unwrap();

        terminate_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap().unwrap();
        assert!(controller.commands().is_empty());
    }
}
