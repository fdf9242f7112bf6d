//! Protocol-aware probe set.
//!
//! Each probe is a function of an IPv4 address that returns an [`Observation`]
//! within a bounded wall time. A probe never lets an error escape: connection
//! refusal, timeout, and any other I/O fault are all captured as an
//! `Observation` with the appropriate `status`.

mod ftp;
mod http;
mod mqtt;
mod rtsp;
mod ssh;
mod tcp;
mod telnet;
mod vnc;

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::types::{Observation, ObservationStatus};

/// Wall-time bound on the initial TCP connect for every probe.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Closed set of probe variants, discriminated once at construction time by
/// [`for_port`]. Each variant knows its own port and service label.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    Http { port: u16, tls: bool },
    Ssh { port: u16 },
    Ftp { port: u16 },
    Telnet { port: u16 },
    Rtsp { port: u16 },
    Mqtt { port: u16 },
    Vnc { port: u16 },
    Tcp { port: u16 },
}

impl Probe {
    pub fn port(&self) -> u16 {
        match self {
            Probe::Http { port, .. }
            | Probe::Ssh { port }
            | Probe::Ftp { port }
            | Probe::Telnet { port }
            | Probe::Rtsp { port }
            | Probe::Mqtt { port }
            | Probe::Vnc { port }
            | Probe::Tcp { port } => *port,
        }
    }

    pub async fn run(&self, ip: Ipv4Addr) -> Observation {
        match *self {
            Probe::Http { port, tls } => http::run(ip, port, tls).await,
            Probe::Ssh { port } => ssh::run(ip, port).await,
            Probe::Ftp { port } => ftp::run(ip, port).await,
            Probe::Telnet { port } => telnet::run(ip, port).await,
            Probe::Rtsp { port } => rtsp::run(ip, port).await,
            Probe::Mqtt { port } => mqtt::run(ip, port).await,
            Probe::Vnc { port } => vnc::run(ip, port).await,
            Probe::Tcp { port } => tcp::run(ip, port).await,
        }
    }
}

/// Factory: selects the right probe variant for a port.
pub fn for_port(port: u16) -> Probe {
    match port {
        80 | 8000 | 8080 => Probe::Http { port, tls: false },
        443 | 8443 => Probe::Http { port, tls: true },
        22 => Probe::Ssh { port },
        21 => Probe::Ftp { port },
        23 => Probe::Telnet { port },
        554 => Probe::Rtsp { port },
        1883 => Probe::Mqtt { port },
        5900 => Probe::Vnc { port },
        _ => Probe::Tcp { port },
    }
}

/// Connect with the standard [`CONNECT_TIMEOUT`], translating every failure
/// mode into the Observation status it should produce.
async fn connect(ip: Ipv4Addr, port: u16, service: &str, start: std::time::Instant) -> Result<TcpStream, Observation> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let status = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ObservationStatus::Closed
            } else {
                ObservationStatus::Error
            };
            Err(Observation::new(ip.to_string(), port, service, status, latency_ms).with_error(e.to_string()))
        }
        Err(_) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            Err(
                Observation::new(ip.to_string(), port, service, ObservationStatus::Timeout, latency_ms)
                    .with_error("Timeout"),
            )
        }
    }
}

/// Read up to `max` bytes from `stream` within `read_timeout`. Returns an
/// empty buffer (not an error) on timeout or EOF-with-no-data, matching the
/// "banner grab is opportunistic" contract every probe relies on.
async fn read_some(stream: &mut TcpStream, max: usize, read_timeout: Duration) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; max];
    match timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            buf
        }
        _ => Vec::new(),
    }
}

fn lossy_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_selects_http_and_tls_flag() {
        assert!(matches!(for_port(80), Probe::Http { tls: false, .. }));
        assert!(matches!(for_port(8080), Probe::Http { tls: false, .. }));
        assert!(matches!(for_port(443), Probe::Http { tls: true, .. }));
        assert!(matches!(for_port(8443), Probe::Http { tls: true, .. }));
    }

    #[test]
    fn factory_selects_protocol_probes() {
        assert!(matches!(for_port(22), Probe::Ssh { .. }));
        assert!(matches!(for_port(21), Probe::Ftp { .. }));
        assert!(matches!(for_port(23), Probe::Telnet { .. }));
        assert!(matches!(for_port(554), Probe::Rtsp { .. }));
        assert!(matches!(for_port(1883), Probe::Mqtt { .. }));
        assert!(matches!(for_port(5900), Probe::Vnc { .. }));
    }

    #[test]
    fn factory_falls_back_to_generic_tcp() {
        assert!(matches!(for_port(9999), Probe::Tcp { .. }));
        assert!(matches!(for_port(3389), Probe::Tcp { .. }));
    }
}
