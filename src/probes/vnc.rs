use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::{connect, lossy_utf8, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// VNC/RFB probe: exchanges protocol versions, then reads the security-type
/// list (or failure reason if the server rejects the connection outright).
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "vnc", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let version_bytes = read_some(&mut stream, 12, READ_TIMEOUT).await;
    let version = lossy_utf8(&version_bytes).trim().to_string();

    if version_bytes.len() == 12 {
        let _ = timeout(WRITE_TIMEOUT, stream.write_all(&version_bytes)).await;
    }

    let count_byte = read_some(&mut stream, 1, READ_TIMEOUT).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let banner = match count_byte.first() {
        None => format!("{version} (Connect Failed: No Response)"),
        Some(0) => {
            let reason = lossy_utf8(&read_some(&mut stream, 100, READ_TIMEOUT).await);
            format!("{version} (Connect Failed: {reason})")
        }
        Some(&n) => {
            let types = read_some(&mut stream, n as usize, READ_TIMEOUT).await;
            let joined = types
                .iter()
                .map(|&t| security_type_name(t))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{version} | Auth: [{joined}]")
        }
    };

    Observation::new(ip.to_string(), port, "vnc", ObservationStatus::Open, latency_ms).with_banner(banner)
}

fn security_type_name(t: u8) -> String {
    match t {
        1 => "None (OPEN)".to_string(),
        2 => "VNC Auth".to_string(),
        16 => "TightVNC".to_string(),
        19 => "VeNCrypt (TLS)".to_string(),
        k => format!("Type({k})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_security_types() {
        assert_eq!(security_type_name(1), "None (OPEN)");
        assert_eq!(security_type_name(2), "VNC Auth");
        assert_eq!(security_type_name(16), "TightVNC");
        assert_eq!(security_type_name(19), "VeNCrypt (TLS)");
        assert_eq!(security_type_name(42), "Type(42)");
    }
}
