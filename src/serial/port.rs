//! Abstractions for working with serial ports.

use serialport::{ClearBuffer, DataBits, Error, ErrorKind, FlowControl, Parity, SerialPort, StopBits};

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The controller link runs at 115200 baud, 8N1, without flow control.
pub const BAUD_RATE: u32 = 115_200;

/// How long a single read blocks before the server loop regains control.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Opens serial ports given a path.
///
/// Implemented for closures so tests can substitute a simulated controller for the real device.
pub trait OpenPort: Send {
    fn open(&self, path: &Path) -> serialport::Result<Box<dyn SerialPort>>;
}

impl<F> OpenPort for F
where
    F: Fn(&Path) -> serialport::Result<Box<dyn SerialPort>> + Send,
{
    fn open(&self, path: &Path) -> serialport::Result<Box<dyn SerialPort>> {
        self(path)
    }
}

/// A wrapper around a serial port that can be reopened if the serial port is closed.
pub struct Port {
    /// Used whenever the serial port needs to be (re)opened.
    open: Box<dyn OpenPort>,
    path: PathBuf,
    /// The internal serial port, if it is opened.
    port: Option<Box<dyn SerialPort>>,
    /// Whether a device is connected to the other end of the serial port. Always false if the
    /// serial port is not open.
    device_connected: bool,
}

impl Port {
    /// Creates a new `Port` that accesses a serial port at `path`.
    ///
    /// Returns a `Port` regardless of whether the serial port was successfully opened, and
    /// additionally an `Err` if there was an error during the attempt.
    pub fn new(path: PathBuf) -> (Self, serialport::Result<()>) {
        Port::with_open_fn(path, open_serial_port)
    }

    /// Like [`new`][Self::new], but uses a custom function for opening the serial port.
    pub fn with_open_fn<F: OpenPort + 'static>(
        path: PathBuf,
        open_fn: F,
    ) -> (Self, serialport::Result<()>) {
        let mut port = Port {
            open: Box::new(open_fn),
            path,
            port: None,
            device_connected: false,
        };

        let error = port.try_open();

        (port, error)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the serial port is open and has a device connected.
    ///
    /// The return value may be out of date; only reading or writing proves the port is usable.
    fn is_accessible(&self) -> bool {
        self.port.is_some() && self.device_connected
    }

    /// Updates the device connected flag. Closes the port and returns `Err` if the serial port is
    /// open but cannot be accessed.
    fn update_port_state(&mut self) -> serialport::Result<()> {
        match self.port {
            Some(ref mut p) => match is_device_connected(p.as_mut()) {
                Ok(c) => self.device_connected = c,
                Err(e) => {
                    self.device_connected = false;
                    self.port = None;
                    return Err(e);
                }
            },
            None => self.device_connected = false,
        }

        Ok(())
    }

    /// Tries to open the serial port. Returns `Ok` if the serial port is now available.
    ///
    /// If the serial port is already open, this only checks whether a device is connected to it.
    pub fn try_open(&mut self) -> serialport::Result<()> {
        if self.port.is_none() {
            self.port = Some(self.open.open(&self.path)?);
        }

        self.update_port_state()?;

        if self.device_connected {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::NoDevice,
                "the serial port is open but no device is connected",
            ))
        }
    }

    /// Calls `f` on the internal serial port if it is accessible, or returns `Err` otherwise.
    fn map_port<F, G>(&mut self, f: F) -> io::Result<G>
    where
        F: FnOnce(&mut dyn SerialPort) -> io::Result<G>,
    {
        self.update_port_state()?;

        match self.port {
            Some(ref mut p) if self.device_connected => f(p.as_mut()),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Read for Port {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.map_port(|p| p.read(buf))
    }
}

impl Write for Port {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.map_port(|p| p.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.map_port(|p| p.flush())
    }
}

/// Opens the controller's serial port at `path`.
pub fn open_serial_port(path: &Path) -> serialport::Result<Box<dyn SerialPort>> {
    let path = path.to_string_lossy();

    serialport::new(path, BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .and_then(|p| {
            // Discard anything buffered before the gateway started
            p.clear(ClearBuffer::All).map(|_| p)
        })
}

/// Returns whether a device is connected to the serial port, or `Err` if it could not be accessed.
fn is_device_connected<P: SerialPort + ?Sized>(port: &mut P) -> serialport::Result<bool> {
    match port.flow_control()? {
        // Without flow control the port must still be touched to surface errors
        FlowControl::None => port.bytes_to_read().map(|_| true),
        FlowControl::Hardware | FlowControl::Software => port.read_clear_to_send(),
    }
}

#[cfg(test)]
mod tests {
    use mock::controller::SimulatedController;
    use relay_protocol::{Body, ChannelId, Command, Frame, Switch};

    use super::*;

    const FAKE_PORT: &str = "fakeport";

    fn initialize_port() -> (Port, serialport::Result<()>, SimulatedController) {
        let controller = SimulatedController::new();
        let (port, error) = Port::with_open_fn(FAKE_PORT.into(), controller.open_fn());

        (port, error, controller)
    }

    #[test]
    fn test_new() {
        let (_, error) = Port::new(FAKE_PORT.into());
        assert!(error.is_err());

        let (port, error, _) = initialize_port();
        assert!(error.is_ok());
        assert!(port.is_accessible());
        assert_eq!(Path::new(FAKE_PORT), port.path());
    }

    #[test]
    fn test_unplugged_at_startup() {
        let controller = SimulatedController::new();
        controller.set_has_error(true);

        let (mut port, error) = Port::with_open_fn(FAKE_PORT.into(), controller.open_fn());
        assert!(error.is_err());
        assert!(!port.is_accessible());

        controller.set_has_error(false);
        assert!(port.try_open().is_ok());
        assert!(port.is_accessible());
    }

    #[test]
    fn test_try_open() {
        let (mut port, _, controller) = initialize_port();

        assert!(port.try_open().is_ok());

        // Disconnect the device by causing an error
        controller.set_has_error(true);

        assert!(port.try_open().is_err());
        assert!(port.port.is_none());
        assert!(!port.is_accessible());

        // Subsequent attempts to open the device fail as well
        assert!(port.try_open().is_err());

        controller.set_has_error(false);

        assert!(port.try_open().is_ok());
        assert!(port.port.is_some());
        assert!(port.is_accessible());
    }

    #[test]
    fn test_io() {
        let (mut port, _, controller) = initialize_port();
        let command = Command::SetRelay {
            channel: ChannelId::One,
            desired: Switch::On,
        };

        port.write_all(&relay_protocol::encode(command, 7)).unwrap();
        assert_eq!(vec![(7, command)], controller.commands());

        let mut buf = [0; 64];
        let n = port.read(&mut buf).unwrap();
        let ack = Frame::decode(&buf[..n]).unwrap();
        assert_eq!(7, ack.sequence);
        assert!(matches!(ack.body, Body::Ack(report) if report.channel == ChannelId::One));

        controller.set_has_error(true);

        assert!(port.write(&[]).is_err());
        assert!(port.read(&mut buf).is_err());
        assert!(port.port.is_none());

        controller.set_has_error(false);

        // I/O still fails because the port was not reopened
        assert!(port.write(&[]).is_err());
        assert!(port.read(&mut buf).is_err());
    }
}
