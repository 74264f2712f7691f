//! Gateway configuration, parsed from the command line and environment.

use clap::Parser;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Threshold applied to a channel that was never configured.
pub const DEFAULT_THRESHOLD_MA: u32 = 2500;
/// Consecutive over-threshold samples required to trip a channel.
pub const DEFAULT_TRIP_SAMPLES: usize = 3;

/// Command line arguments.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "HTTP gateway for a two-channel relay and overcurrent controller")]
pub struct Cli {
    /// Path of the serial port the controller is attached to.
    #[arg(env = "RELAY_GATEWAY_SERIAL_PORT")]
    pub serial_port: PathBuf,

    /// Address the HTTP control surface listens on.
    #[arg(long, env = "RELAY_GATEWAY_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// Address the live measurement feed (WebSocket) listens on.
    #[arg(long, env = "RELAY_GATEWAY_FEED_ADDR", default_value = "0.0.0.0:8081")]
    pub feed_addr: SocketAddr,

    /// How long to wait for each acknowledgement.
    #[arg(long, default_value_t = 200)]
    pub ack_timeout_ms: u64,

    /// Transmissions of a frame before the controller is declared unreachable.
    #[arg(long, default_value_t = 3)]
    pub attempts: u32,

    /// Consecutive over-threshold samples that trip a channel.
    #[arg(long, default_value_t = DEFAULT_TRIP_SAMPLES)]
    pub trip_samples: usize,

    /// Threshold applied at startup, in milliamps.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD_MA)]
    pub default_threshold_ma: u32,

    /// Commands that may wait in the queue before submitters are made to wait.
    #[arg(long, default_value_t = 16)]
    pub queue_capacity: usize,
}

/// Timing of the serial request/acknowledgement exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub ack_timeout: Duration,
    pub attempts: u32,
    /// A partial frame is discarded after the link has been silent this long.
    pub inter_byte_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            ack_timeout: Duration::from_millis(200),
            attempts: 3,
            inter_byte_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub serial_port: PathBuf,
    pub http_addr: SocketAddr,
    pub feed_addr: SocketAddr,
    pub link: LinkConfig,
    pub default_threshold_ma: u32,
    pub trip_samples: usize,
    pub queue_capacity: usize,
}

impl GatewayConfig {
    /// Returns a configuration for `serial_port` with every other setting at its default and both
    /// listeners on ephemeral loopback ports.
    pub fn new(serial_port: impl Into<PathBuf>) -> Self {
        let loopback: SocketAddr = ([127, 0, 0, 1], 0).into();

        GatewayConfig {
            serial_port: serial_port.into(),
            http_addr: loopback,
            feed_addr: loopback,
            link: LinkConfig::default(),
            default_threshold_ma: DEFAULT_THRESHOLD_MA,
            trip_samples: DEFAULT_TRIP_SAMPLES,
            queue_capacity: 16,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.attempts == 0 {
            return Err(ConfigError::Zero("attempts"));
        }
        if self.link.ack_timeout.is_zero() {
            return Err(ConfigError::Zero("ack timeout"));
        }
        if self.default_threshold_ma == 0 {
            return Err(ConfigError::Zero("default threshold"));
        }
        if self.trip_samples == 0 {
            return Err(ConfigError::Zero("trip samples"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }

        Ok(())
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let config = GatewayConfig {
            serial_port: cli.serial_port,
            http_addr: cli.http_addr,
            feed_addr: cli.feed_addr,
            link: LinkConfig {
                ack_timeout: Duration::from_millis(cli.ack_timeout_ms),
                attempts: cli.attempts,
                ..LinkConfig::default()
            },
            default_threshold_ma: cli.default_threshold_ma,
            trip_samples: cli.trip_samples,
            queue_capacity: cli.queue_capacity,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["relay-gateway", "/dev/ttyUSB0"]).unwrap();
        let config = GatewayConfig::try_from(cli).unwrap();

        assert_eq!(PathBuf::from("/dev/ttyUSB0"), config.serial_port);
        assert_eq!("0.0.0.0:8080".parse::<SocketAddr>().unwrap(), config.http_addr);
        assert_eq!(LinkConfig::default(), config.link);
        assert_eq!(2500, config.default_threshold_ma);
        assert_eq!(3, config.trip_samples);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "relay-gateway",
            "COM3",
            "--ack-timeout-ms",
            "50",
            "--attempts",
            "5",
            "--trip-samples",
            "1",
        ])
        .unwrap();
        let config = GatewayConfig::try_from(cli).unwrap();

        assert_eq!(Duration::from_millis(50), config.link.ack_timeout);
        assert_eq!(5, config.link.attempts);
        assert_eq!(1, config.trip_samples);
    }

    #[test]
    fn test_zero_values_rejected() {
        let cli = Cli::try_parse_from(["relay-gateway", "COM3", "--attempts", "0"]).unwrap();
        assert_eq!(Err(ConfigError::Zero("attempts")), GatewayConfig::try_from(cli));

        let mut config = GatewayConfig::new("COM3");
        assert!(config.validate().is_ok());
        config.default_threshold_ma = 0;
        assert_eq!(Err(ConfigError::Zero("default threshold")), config.validate());
    }
}
