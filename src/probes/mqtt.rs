use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::{connect, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fixed MQTT 3.1.1 CONNECT packet, client id "test", clean session, no auth.
const CONNECT_PACKET: [u8; 18] = [
    0x10, 0x10, 0x00, 0x04, 0x4d, 0x51, 0x54, 0x54, 0x04, 0x02, 0x00, 0x3c, 0x00, 0x04, 0x74, 0x65,
    0x73, 0x74,
];

/// MQTT probe: sends a minimal CONNECT packet and decodes the CONNACK return
/// code.
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "mqtt", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let _ = timeout(WRITE_TIMEOUT, stream.write_all(&CONNECT_PACKET)).await;
    let resp = read_some(&mut stream, 4, READ_TIMEOUT).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let status = connack_status(&resp);
    Observation::new(ip.to_string(), port, "mqtt", ObservationStatus::Open, latency_ms).with_banner(status)
}

fn connack_status(resp: &[u8]) -> String {
    if resp.len() < 4 || resp[0] != 0x20 {
        return "Unknown".to_string();
    }
    match resp[3] {
        0 => "Access ALLOWED (No Auth)".to_string(),
        1 => "Refused: Protocol Version".to_string(),
        2 => "Refused: ID Rejected".to_string(),
        3 => "Refused: Server Unavailable".to_string(),
        4 => "Refused: Bad User/Pass".to_string(),
        5 => "Refused: Not Authorized".to_string(),
        n => format!("Refused: Code {n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_connack_codes() {
        assert_eq!(connack_status(&[0x20, 0x02, 0x00, 0x00]), "Access ALLOWED (No Auth)");
        assert_eq!(connack_status(&[0x20, 0x02, 0x00, 0x04]), "Refused: Bad User/Pass");
        assert_eq!(connack_status(&[0x20, 0x02, 0x00, 0x05]), "Refused: Not Authorized");
        assert_eq!(connack_status(&[0x20, 0x02, 0x00, 0x09]), "Refused: Code 9");
    }

    #[test]
    fn non_connack_packet_is_reported() {
        assert_eq!(connack_status(&[]), "Unknown");
        assert_eq!(connack_status(&[0x30, 0x00]), "Unknown");
    }
}
