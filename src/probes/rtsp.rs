use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::{connect, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

const BRANDS: &[&str] = &["hikvision", "dahua", "axis", "foscam", "amcrest", "reolink", "ubiquiti"];

/// RTSP probe: sends an `OPTIONS` request (the camera "hello") and classifies
/// the auth requirement and inferred brand.
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "rtsp", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let request = format!("OPTIONS rtsp://{ip}:{port}/ RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: DeepFocus\r\n\r\n");
    let _ = timeout(WRITE_TIMEOUT, stream.write_all(request.as_bytes())).await;

    let response = String::from_utf8_lossy(&read_some(&mut stream, 1024, READ_TIMEOUT).await).to_string();
    let latency_ms = start.elapsed().as_millis() as u64;

    let auth_status = classify_auth(&response);
    let brand = identify_brand(&response);
    let banner = format!("{brand} | Auth: [{auth_status}]");

    Observation::new(ip.to_string(), port, "rtsp", ObservationStatus::Open, latency_ms).with_banner(banner)
}

fn classify_auth(response: &str) -> &'static str {
    if response.contains("RTSP/1.0 200") {
        "No Auth Required (OPEN)"
    } else if response.contains("RTSP/1.0 401") {
        "Auth Required"
    } else if response.contains("RTSP/1.0 403") {
        "Forbidden"
    } else {
        "Unknown"
    }
}

fn identify_brand(response: &str) -> String {
    let lower = response.to_ascii_lowercase();
    for brand in BRANDS {
        if lower.contains(brand) {
            let mut chars = brand.chars();
            return match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => brand.to_string(),
            };
        }
    }
    "RTSP Camera".to_string()
}
