use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_native_tls::native_tls::{self, Certificate};
use tokio_native_tls::TlsConnector;
use x509_parser::prelude::*;

use super::connect;
use crate::types::{Observation, ObservationStatus};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_READ: usize = 4096;

/// HTTP(S) probe: minimal `GET /` with a Host/User-Agent/Connection header
/// set, parsed into status code, headers, and body.
pub async fn run(ip: Ipv4Addr, port: u16, tls: bool) -> Observation {
    let start = Instant::now();
    let service = if tls { "https" } else { "http" };
    let stream = match connect(ip, port, service, start).await {
        Ok(s) => s,
        Err(obs) => return obs,
    };

    let (raw, cert_info) = if tls {
        match tls_handshake_and_request(stream, ip, port).await {
            Ok(pair) => pair,
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                return Observation::new(ip.to_string(), port, service, ObservationStatus::Error, latency_ms)
                    .with_error(e);
            }
        }
    } else {
        let mut stream = stream;
        match plaintext_request(&mut stream, ip, port).await {
            Ok(raw) => (raw, BTreeMap::new()),
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                return Observation::new(ip.to_string(), port, service, ObservationStatus::Error, latency_ms)
                    .with_error(e);
            }
        }
    };

    let latency_ms = start.elapsed().as_millis() as u64;
    let mut obs = Observation::new(ip.to_string(), port, service, ObservationStatus::Open, latency_ms);
    obs.cert_info = cert_info;
    apply_response(&mut obs, &raw);
    obs
}

fn request_bytes(ip: Ipv4Addr) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\nHost: {ip}\r\nUser-Agent: DeepFocus/1.0\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

async fn plaintext_request(
    stream: &mut tokio::net::TcpStream,
    ip: Ipv4Addr,
    _port: u16,
) -> Result<String, String> {
    stream.write_all(&request_bytes(ip)).await.map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; MAX_READ];
    let n = timeout(READ_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| "Timeout".to_string())?
        .map_err(|e| e.to_string())?;
    buf.truncate(n);
    Ok(String::from_utf8_lossy(&buf).to_string())
}

async fn tls_handshake_and_request(
    stream: tokio::net::TcpStream,
    ip: Ipv4Addr,
    _port: u16,
) -> Result<(String, BTreeMap<String, String>), String> {
    let domain = ip.to_string();
    let builder = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| e.to_string())?;
    let connector = TlsConnector::from(builder);
    let mut tls_stream = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(&domain, stream))
        .await
        .map_err(|_| "Timeout".to_string())?
        .map_err(|e| e.to_string())?;

    let cert_info = match tls_stream.get_ref().peer_certificate() {
        Ok(Some(cert)) => cert_summary(&cert),
        _ => BTreeMap::new(),
    };

    tls_stream
        .write_all(&request_bytes(ip))
        .await
        .map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; MAX_READ];
    let n = timeout(READ_TIMEOUT, tls_stream.read(&mut buf))
        .await
        .map_err(|_| "Timeout".to_string())?
        .map_err(|e| e.to_string())?;
    buf.truncate(n);
    Ok((String::from_utf8_lossy(&buf).to_string(), cert_info))
}

fn cert_summary(cert: &Certificate) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Ok(der) = cert.to_der() else { return out };
    let Ok((_, x509)) = parse_x509_certificate(&der) else { return out };
    if let Some(cn) = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        out.insert("subject_cn".to_string(), cn.to_string());
    }
    if let Some(cn) = x509
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        out.insert("issuer_cn".to_string(), cn.to_string());
    }
    if let Ok(not_after) = x509.validity().not_after.to_rfc2822() {
        out.insert("not_after".to_string(), not_after);
    }
    out
}

/// Split `raw` on the first `\r\n\r\n`, parse the status line and headers
/// into `obs`, and store the head section verbatim as the banner.
fn apply_response(obs: &mut Observation, raw: &str) {
    let (head, body) = match raw.split_once("\r\n\r\n") {
        Some((h, b)) => (h, Some(b.to_string())),
        None => (raw, None),
    };

    obs.banner = Some(head.to_string());
    obs.body = body;

    let mut lines = head.split("\r\n");
    if let Some(status_line) = lines.next() {
        if let Some(code) = status_line.split(' ').nth(1).and_then(|s| s.parse::<u16>().ok()) {
            obs.response_code = Some(code);
        }
    }

    for line in lines {
        if let Some((k, v)) = line.split_once(": ") {
            obs.headers.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_code_and_headers() {
        let mut obs = Observation::new("1.2.3.4".into(), 80, "http", ObservationStatus::Open, 0);
        let raw = "HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nContent-Type: text/html\r\n\r\n<html></html>";
        apply_response(&mut obs, raw);
        assert_eq!(obs.response_code, Some(200));
        assert_eq!(obs.headers.get("server").map(String::as_str), Some("nginx/1.18.0"));
        assert_eq!(obs.body.as_deref(), Some("<html></html>"));
        assert!(obs.banner.as_deref().unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let mut obs = Observation::new("1.2.3.4".into(), 80, "http", ObservationStatus::Open, 0);
        let raw = "HTTP/1.1 200 OK\r\nServer: first\r\nServer: second\r\n\r\n";
        apply_response(&mut obs, raw);
        assert_eq!(obs.headers.get("server").map(String::as_str), Some("second"));
    }

    #[test]
    fn no_body_separator_keeps_whole_response_as_head() {
        let mut obs = Observation::new("1.2.3.4".into(), 80, "http", ObservationStatus::Open, 0);
        let raw = "HTTP/1.1 200 OK\r\nServer: x";
        apply_response(&mut obs, raw);
        assert!(obs.body.is_none());
        assert_eq!(obs.response_code, Some(200));
    }
}
