use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::{connect, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Telnet probe: reads whatever the server dumps first and strips every byte
/// outside printable ASCII (0x20-0x7E).
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "telnet", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let raw = read_some(&mut stream, 1024, READ_TIMEOUT).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let cleaned = strip_non_printable(&String::from_utf8_lossy(&raw));

    Observation::new(ip.to_string(), port, "telnet", ObservationStatus::Open, latency_ms).with_banner(cleaned)
}

fn strip_non_printable(s: &str) -> String {
    s.chars().filter(|&c| ('\u{20}'..='\u{7E}').contains(&c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_control_bytes() {
        let raw = "\u{1b}[2Jwelcome\r\nlogin:\u{07}";
        assert_eq!(strip_non_printable(raw), "[2Jwelcomelogin:");
    }

    #[test]
    fn preserves_plain_ascii() {
        assert_eq!(strip_non_printable("hello world"), "hello world");
    }
}
