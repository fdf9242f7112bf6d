use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::{connect, lossy_utf8, read_some};
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// FTP probe: probes anonymous-login capability by walking the USER/PASS
/// handshake after a `220` greeting.
pub async fn run(ip: Ipv4Addr, port: u16) -> Observation {
    let start = Instant::now();
    let mut stream = match connect(ip, port, "ftp", start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let greeting = lossy_utf8(&read_some(&mut stream, 1024, READ_TIMEOUT).await);

    let auth_status = if greeting.starts_with("220") {
        let _ = timeout(WRITE_TIMEOUT, stream.write_all(b"USER anonymous\r\n")).await;
        let user_resp = lossy_utf8(&read_some(&mut stream, 1024, READ_TIMEOUT).await);

        if user_resp.starts_with("331") {
            let _ = timeout(WRITE_TIMEOUT, stream.write_all(b"PASS anonymous@\r\n")).await;
            let pass_resp = lossy_utf8(&read_some(&mut stream, 1024, READ_TIMEOUT).await);
            classify_pass_response(&pass_resp)
        } else {
            classify_user_response(&user_resp)
        }
    } else {
        "Unknown".to_string()
    };

    let latency_ms = start.elapsed().as_millis() as u64;
    let banner = format!("{greeting} | Auth: [{auth_status}]");
    Observation::new(ip.to_string(), port, "ftp", ObservationStatus::Open, latency_ms).with_banner(banner)
}

fn classify_pass_response(resp: &str) -> String {
    if resp.starts_with("230") {
        "Anonymous Access ALLOWED".to_string()
    } else if resp.starts_with("530") {
        "Anonymous Access DENIED (530)".to_string()
    } else {
        format!("Login Failed Code: {}", resp.get(..3).unwrap_or(resp))
    }
}

fn classify_user_response(resp: &str) -> String {
    if resp.starts_with("230") {
        "Anonymous Access ALLOWED (No Pass)".to_string()
    } else if resp.starts_with("530") {
        "Anonymous User Rejected".to_string()
    } else if resp.starts_with("500") || resp.to_ascii_lowercase().contains("auth") {
        "Encryption Required (AUTH TLS)".to_string()
    } else {
        format!("Handshake Error: {}", resp.get(..3).unwrap_or(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_response_classification() {
        assert_eq!(classify_pass_response("230 Login successful"), "Anonymous Access ALLOWED");
        assert_eq!(classify_pass_response("530 Access denied"), "Anonymous Access DENIED (530)");
        assert_eq!(classify_pass_response("500 Huh?"), "Login Failed Code: 500");
    }

    #[test]
    fn user_response_classification() {
        assert_eq!(classify_user_response("230 Logged in"), "Anonymous Access ALLOWED (No Pass)");
        assert_eq!(classify_user_response("530 Not allowed"), "Anonymous User Rejected");
        assert_eq!(classify_user_response("500 AUTH TLS required"), "Encryption Required (AUTH TLS)");
        assert_eq!(classify_user_response("999 ???"), "Handshake Error: 999");
    }
}
