use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::{connect, lossy_utf8, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Generic TCP connect probe: open, grab up to 1024 bytes of whatever the
/// server offers first, decode lossily. Used for any port with no dedicated
/// protocol probe.
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "tcp", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let banner_bytes = read_some(&mut stream, 1024, READ_TIMEOUT).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let mut obs = Observation::new(ip.to_string(), port, "tcp", ObservationStatus::Open, latency_ms);
    if !banner_bytes.is_empty() {
        obs = obs.with_banner(lossy_utf8(&banner_bytes));
    }
    obs
}
