use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::{connect, lossy_utf8, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// SSH probe: reads the server identification line and derives a coarse
/// device hint from well-known substrings.
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "ssh", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let banner_bytes = read_some(&mut stream, 256, READ_TIMEOUT).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let banner_str = lossy_utf8(&banner_bytes);

    let device_hint = device_hint(&banner_str);
    let banner = format!("{banner_str} | Device: [{device_hint}]");

    Observation::new(ip.to_string(), port, "ssh", ObservationStatus::Open, latency_ms).with_banner(banner)
}

fn device_hint(banner: &str) -> &'static str {
    let lower = banner.to_ascii_lowercase();
    if lower.contains("dropbear") {
        "Dropbear (Embedded/IoT)"
    } else if lower.contains("cisco") {
        "Cisco IOS"
    } else if lower.contains("mikrotik") {
        "MikroTik Router"
    } else if lower.contains("openssh") {
        "OpenSSH"
    } else {
        "SSH Service"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_cover_known_devices() {
        assert_eq!(device_hint("SSH-2.0-dropbear_2019.78"), "Dropbear (Embedded/IoT)");
        assert_eq!(device_hint("SSH-2.0-Cisco-1.25"), "Cisco IOS");
        assert_eq!(device_hint("SSH-2.0-ROSSSH MikroTik"), "MikroTik Router");
        assert_eq!(device_hint("SSH-2.0-OpenSSH_8.9p1"), "OpenSSH");
        assert_eq!(device_hint("SSH-2.0-libssh_0.9.6"), "SSH Service");
    }
}
