use std::fmt;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::errors::{AcquisitionError, Result};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_READ_TIMEOUT_MS: u64 = 200;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Byte source the acquisition loop reads from.
pub trait Transport: Read + Send {}
impl<T: Read + Send> Transport for T {}

/// Where the device is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Serial { path, baud } => write!(f, "{path}@{baud}"),
        }
    }
}

/// Opens a [`Transport`] to an [`Endpoint`], retrying with exponential backoff.
#[derive(Debug, Clone)]
pub struct Connector {
    pub connect_timeout: Duration,
    /// Blocking reads give up after this long so the loop can check its
    /// deadline and the cancel flag.
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for Connector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl Connector {
    pub fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying connection after {:?} (target={}, attempt={})",
                    delay, endpoint, attempt
                );
                thread::sleep(delay);
            }

            match self.open(endpoint) {
                Ok(transport) => {
                    info!("connection established: target={}", endpoint);
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(
                        "connection attempt failed: target={}, attempt={}, error={}",
                        endpoint, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AcquisitionError::Connect {
            target: endpoint.to_string(),
            source: std::io::Error::other("max retries exceeded"),
        }))
    }

    fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = self.open_tcp(host, *port).map_err(|source| {
                    AcquisitionError::Connect {
                        target: endpoint.to_string(),
                        source,
                    }
                })?;
                Ok(Box::new(stream))
            }
            Endpoint::Serial { path, baud } => {
                debug!("opening serial port: path={}, baud={}", path, baud);
                let port = serialport::new(path.as_str(), *baud)
                    .timeout(self.read_timeout)
                    .open()?;
                Ok(Box::new(port))
            }
        }
    }

    fn open_tcp(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            debug!("opening tcp socket: addr={}", addr);
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{host} did not resolve to any address"),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use super::*;

    fn quick() -> Connector {
        Connector {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(100),
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn endpoint_display() {
        let tcp = Endpoint::Tcp {
            host: "picouart05.na.infn.it".into(),
            port: 23,
        };
        assert_eq!(tcp.to_string(), "picouart05.na.infn.it:23");
        let serial = Endpoint::Serial {
            path: "COM7".into(),
            baud: 2_000_000,
        };
        assert_eq!(serial.to_string(), "COM7@2000000");
    }

    #[test]
    fn reads_from_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"START").unwrap();
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut transport = quick().connect(&endpoint).unwrap();
        server.join().unwrap();
        let mut buf = Vec::new();
        transport.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"START");
    }

    #[test]
    fn refused_connection_is_fatal() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let err = quick().connect(&endpoint).err().unwrap();
        assert!(matches!(err, AcquisitionError::Connect { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_serial_port_is_fatal() {
        let endpoint = Endpoint::Serial {
            path: "/dev/pico-reader-missing".into(),
            baud: 2_000_000,
        };
        let err = quick().connect(&endpoint).err().unwrap();
        assert!(err.is_fatal());
    }
}
