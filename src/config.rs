use std::time::Duration;

use anyhow::{Result, Context, bail};
use tokio::net::TcpStream;
use tokio_serial::{SerialStream, SerialPortBuilderExt};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::engine::EngineConfig;
use crate::protocol::addresses::DEFAULT_SLAVE;
use crate::sequencer::{Client, Sequencer, SequencerConfig};
use crate::transport::Framing;


pub const DEFAULT_BAUD_RATE: u32 = 9600;


/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
}


/// Bus connection arguments shared by every binary.
#[derive(clap::Args, Debug, Clone)]
pub struct BusArgs {
    /// URL of the port to connect to
    ///
    /// either serial:///device/path or tcp+raw://host:port URLs supported
    pub port: Url,

    /// Baud rate of serial ports (the line is always 8E1)
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// How responses are split into frames: chunk-length or length-aware
    #[arg(long, default_value_t = Framing::ChunkLength)]
    pub framing: Framing,

    /// Idle time before each request
    #[arg(long, default_value_t = 25)]
    pub silent_interval_ms: u64,

    /// Time to wait for each response
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Modbus slave address of the adaptor
    #[arg(long, default_value_t = DEFAULT_SLAVE)]
    pub slave: u8,

    /// Register number of unit 0's first control register
    #[arg(long, default_value_t = crate::protocol::addresses::CONTROL_FIRST)]
    pub control_base: u16,
}

impl BusArgs {
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            silent_interval: Duration::from_millis(self.silent_interval_ms),
            response_timeout: Duration::from_millis(self.timeout_ms),
            framing: self.framing
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            slave: self.slave,
            control_register_base: self.control_base,
            ..Default::default()
        }
    }

    /// Open the port and start a command sequencer on it.
    pub async fn connect(&self) -> Result<Client> {
        let port = Port::open(&self.port, self.baud).await?;

        Ok(port.spawn_sequencer(self.sequencer_config()))
    }
}


/// The adaptor's line: 8 data bits, even parity, 1 stop bit.
fn bus_line(path: &str, baud: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(path, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::Even)
        .stop_bits(tokio_serial::StopBits::One)
}

/// Host and port of a `tcp+raw://host:port` URL.
fn socket_addr(url: &Url) -> Result<(&str, u16)> {
    let host = url.host_str()
        .with_context(|| format!("no host in {url}"))?;

    let port = url.port()
        .with_context(|| format!("no port number in {url}"))?;

    Ok((host, port))
}


/// The line to the adaptor, either a local serial device or a serial server
/// reached over raw TCP.
pub enum Port {
    Serial(SerialStream),
    TcpRaw(TcpStream)
}

impl Port {
    pub async fn open(url: &Url, baud: u32) -> Result<Self> {
        let port = match url.scheme() {
            "serial" => Self::Serial(
                bus_line(url.path(), baud).open_native_async()
                    .with_context(|| format!("failed to open serial port {}", url.path()))?
            ),
            "tcp+raw" => {
                let stream = TcpStream::connect(socket_addr(url)?).await
                    .with_context(|| format!("failed to connect to {url}"))?;

                stream.set_nodelay(true)?;

                Self::TcpRaw(stream)
            },
            other => bail!("url scheme {other} not supported (use serial:// or tcp+raw://)")
        };

        Ok(port)
    }

    pub fn spawn_sequencer(self, config: SequencerConfig) -> Client {
        match self {
            Port::Serial(port) => Sequencer::spawn(port, config),
            Port::TcpRaw(stream) => Sequencer::spawn(stream, config),
        }
    }
}


#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Args {
        #[command(flatten)]
        bus: BusArgs,
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["test", "serial:///dev/ttyUSB0"]);

        assert_eq!(args.bus.port.scheme(), "serial");
        assert_eq!(args.bus.port.path(), "/dev/ttyUSB0");
        assert_eq!(args.bus.baud, DEFAULT_BAUD_RATE);

        let config = args.bus.sequencer_config();
        assert_eq!(config.silent_interval, Duration::from_millis(25));
        assert_eq!(config.response_timeout, Duration::from_millis(1000));
        assert_eq!(config.framing, Framing::ChunkLength);

        let config = args.bus.engine_config();
        assert_eq!(config.slave, 1);
        assert_eq!(config.control_register_base, 40001);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "test", "tcp+raw://localhost:5020",
            "--framing", "length-aware",
            "--silent-interval-ms", "40",
            "--control-base", "42001",
        ]);

        assert_eq!(args.bus.sequencer_config().framing, Framing::LengthAware);
        assert_eq!(args.bus.sequencer_config().silent_interval, Duration::from_millis(40));
        assert_eq!(args.bus.engine_config().control_register_base, 42001);
    }

    #[test]
    fn test_socket_addr() {
        let url = Url::parse("tcp+raw://adaptor.local:5020").unwrap();
        assert_eq!(socket_addr(&url).unwrap(), ("adaptor.local", 5020));

        let url = Url::parse("tcp+raw://adaptor.local").unwrap();
        assert!(socket_addr(&url).is_err());
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let url = Url::parse("http://localhost/").unwrap();
        assert!(Port::open(&url, DEFAULT_BAUD_RATE).await.is_err());
    }
}
