//! Weighted regex fingerprinting: scores an [`Observation`] against a static
//! rule table and returns the best-matching service identity.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Analysis, Observation};

/// Where a pattern is checked against.
enum Location {
    Banner,
    Body,
    /// Body wrapped as `<title>.*pattern.*</title>`; compiled lazily per rule
    /// since the pattern is spliced into the regex itself.
    Title(&'static str),
    Header(&'static str),
}

struct Evidence {
    location: Location,
    regex: Option<&'static Lazy<Regex>>,
    weight: u8,
}

struct Rule {
    name: &'static str,
    service_type: &'static str,
    vendor: &'static str,
    product: &'static str,
    tags: &'static [&'static str],
    evidence: &'static [Evidence],
}

macro_rules! lazy_regex {
    ($name:ident, $pattern:expr) => {
        static $name: Lazy<Regex> = Lazy::new(|| Regex::new($pattern).unwrap());
    };
}

lazy_regex!(APACHE_WEAK, r"(?i)Apache");
lazy_regex!(APACHE_VERSION, r"(?i)Apache/([\d.]+)");
lazy_regex!(APACHE_HEADER, r"(?i)Apache");

lazy_regex!(NGINX_WEAK, r"(?i)nginx");
lazy_regex!(NGINX_VERSION, r"(?i)nginx/([\d.]+)");
lazy_regex!(NGINX_HEADER, r"(?i)nginx");

lazy_regex!(HIKVISION_BANNER, r"(?i)Hikvision");
lazy_regex!(HIKVISION_HEADER, r"(?i)Hikvision");
lazy_regex!(HIKVISION_WEBS_HEADER, r"(?i)App-webs");

lazy_regex!(OPENSSH_WEAK, r"(?i)OpenSSH");
lazy_regex!(OPENSSH_VERSION, r"(?i)OpenSSH_([\w.]+)");

lazy_regex!(GEN_HTTP_PROTO, r"HTTP/\d\.\d");
lazy_regex!(GEN_HTTP_SERVER, r"(?i)Server:");
lazy_regex!(GEN_HTTP_BODY, r"(?i)<html");

lazy_regex!(GEN_RTSP, r"RTSP/\d\.\d");

lazy_regex!(VNC_RFB, r"^RFB \d{3}\.\d{3}");

lazy_regex!(FTP_BANNER, r"(?i)^220.*FTP");
lazy_regex!(FTP_VSFTPD, r"(?i)vsftpd");
lazy_regex!(FTP_PROFTPD, r"(?i)ProFTPD");

lazy_regex!(CADDY_HEADER, r"(?i)Caddy");

lazy_regex!(DAHUA_BANNER, r"(?i)Dahua");
lazy_regex!(DAHUA_HEADER, r"(?i)Dahua");
lazy_regex!(DAHUA_BODY, r"(?i)dahua");

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule {
            name: "Apache",
            service_type: "http",
            vendor: "Apache",
            product: "HTTP Server",
            tags: &[],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&APACHE_WEAK), weight: 40 },
                Evidence { location: Location::Banner, regex: Some(&APACHE_VERSION), weight: 60 },
                Evidence { location: Location::Header("server"), regex: Some(&APACHE_HEADER), weight: 30 },
            ],
        },
        Rule {
            name: "Nginx",
            service_type: "http",
            vendor: "Nginx",
            product: "Nginx",
            tags: &[],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&NGINX_WEAK), weight: 40 },
                Evidence { location: Location::Banner, regex: Some(&NGINX_VERSION), weight: 60 },
                Evidence { location: Location::Header("server"), regex: Some(&NGINX_HEADER), weight: 30 },
            ],
        },
        Rule {
            name: "Hikvision",
            service_type: "camera",
            vendor: "Hikvision",
            product: "IP Camera",
            tags: &["iot", "surveillance"],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&HIKVISION_BANNER), weight: 50 },
                Evidence { location: Location::Title("Hikvision"), regex: None, weight: 60 },
                Evidence { location: Location::Header("server"), regex: Some(&HIKVISION_HEADER), weight: 50 },
                Evidence { location: Location::Header("server"), regex: Some(&HIKVISION_WEBS_HEADER), weight: 30 },
            ],
        },
        Rule {
            name: "OpenSSH",
            service_type: "ssh",
            vendor: "OpenBSD",
            product: "OpenSSH",
            tags: &[],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&OPENSSH_WEAK), weight: 50 },
                Evidence { location: Location::Banner, regex: Some(&OPENSSH_VERSION), weight: 50 },
            ],
        },
        Rule {
            name: "Generic HTTP",
            service_type: "http",
            vendor: "unknown",
            product: "HTTP Server",
            tags: &[],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&GEN_HTTP_PROTO), weight: 30 },
                Evidence { location: Location::Banner, regex: Some(&GEN_HTTP_SERVER), weight: 20 },
                Evidence { location: Location::Body, regex: Some(&GEN_HTTP_BODY), weight: 40 },
            ],
        },
        Rule {
            name: "Generic RTSP",
            service_type: "rtsp",
            vendor: "unknown",
            product: "RTSP Server",
            tags: &[],
            evidence: &[Evidence { location: Location::Banner, regex: Some(&GEN_RTSP), weight: 50 }],
        },
        Rule {
            name: "VNC",
            service_type: "vnc",
            vendor: "RealVNC",
            product: "VNC Server",
            tags: &["remote_desktop"],
            evidence: &[Evidence { location: Location::Banner, regex: Some(&VNC_RFB), weight: 100 }],
        },
        Rule {
            name: "FTP",
            service_type: "ftp",
            vendor: "unknown",
            product: "FTP Server",
            tags: &["file_transfer"],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&FTP_BANNER), weight: 80 },
                Evidence { location: Location::Banner, regex: Some(&FTP_VSFTPD), weight: 90 },
                Evidence { location: Location::Banner, regex: Some(&FTP_PROFTPD), weight: 90 },
            ],
        },
        Rule {
            name: "Caddy",
            service_type: "http",
            vendor: "Caddy",
            product: "Caddy Web Server",
            tags: &[],
            evidence: &[Evidence { location: Location::Header("server"), regex: Some(&CADDY_HEADER), weight: 100 }],
        },
        Rule {
            name: "Dahua",
            service_type: "camera",
            vendor: "Dahua",
            product: "IP Camera",
            tags: &["iot", "surveillance"],
            evidence: &[
                Evidence { location: Location::Banner, regex: Some(&DAHUA_BANNER), weight: 60 },
                Evidence { location: Location::Header("server"), regex: Some(&DAHUA_HEADER), weight: 60 },
                Evidence { location: Location::Body, regex: Some(&DAHUA_BODY), weight: 40 },
            ],
        },
        Rule {
            name: "Home Assistant",
            service_type: "iot",
            vendor: "Home Assistant",
            product: "Home Assistant",
            tags: &["smart_home"],
            evidence: &[
                Evidence { location: Location::Body, regex: Some(&HOME_ASSISTANT_BODY), weight: 80 },
                Evidence { location: Location::Title("Home Assistant"), regex: None, weight: 80 },
            ],
        },
    ]
});

lazy_regex!(HOME_ASSISTANT_BODY, r"(?i)Home Assistant");

/// Evaluate one evidence entry against an observation, returning whether it
/// matched and its first capture group, if any.
fn check_evidence(ev: &Evidence, obs: &Observation) -> (bool, Option<String>) {
    match &ev.location {
        Location::Banner => match_text(obs.banner.as_deref(), ev),
        Location::Body => match_text(obs.body.as_deref(), ev),
        Location::Header(key) => match_text(obs.headers.get(*key).map(String::as_str), ev),
        Location::Title(pattern) => {
            let Some(body) = obs.body.as_deref() else { return (false, None) };
            let wrapped = Regex::new(&format!("(?i)<title>.*{pattern}.*</title>")).unwrap();
            (wrapped.is_match(body), None)
        }
    }
}

fn match_text(text: Option<&str>, ev: &Evidence) -> (bool, Option<String>) {
    let Some(text) = text else { return (false, None) };
    let Some(regex) = ev.regex else { return (false, None) };
    match regex.captures(text) {
        Some(caps) => (true, caps.get(1).map(|m| m.as_str().to_string())),
        None => (false, None),
    }
}

/// Score every rule against `obs`; return the single best match and its
/// details, or `None` if nothing scored above zero.
fn evaluate_rule(rule: &Rule, obs: &Observation) -> (u32, Vec<String>, Option<String>) {
    let mut total = 0u32;
    let mut details = Vec::new();
    let mut version = None;

    for ev in rule.evidence {
        let (matched, captured) = check_evidence(ev, obs);
        if matched {
            total += ev.weight as u32;
            details.push(format!("Matched {}", location_label(&ev.location)));
            // Every match overwrites the running version, including with
            // None — a later non-capturing match clears an earlier capture.
            version = captured;
        }
    }

    (total.min(100), details, version)
}

fn location_label(loc: &Location) -> String {
    match loc {
        Location::Banner => "banner".to_string(),
        Location::Body => "body".to_string(),
        Location::Title(_) => "title".to_string(),
        Location::Header(key) => format!("header:{key}"),
    }
}

/// Run every rule against `obs` and return the identity with the highest
/// score, or the `unknown` fallback if nothing matches.
pub fn analyze(obs: &Observation) -> Analysis {
    let mut best: Option<(&Rule, u32, Vec<String>, Option<String>)> = None;

    for rule in RULES.iter() {
        let (score, details, version) = evaluate_rule(rule, obs);
        let is_better = match &best {
            Some((_, best_score, _, _)) => score > *best_score,
            None => score > 0,
        };
        if is_better {
            best = Some((rule, score, details, version));
        }
    }

    match best {
        Some((rule, score, evidence, version)) if score > 0 => Analysis {
            service_type: rule.service_type.to_string(),
            vendor: rule.vendor.to_string(),
            product: rule.product.to_string(),
            version,
            tags: rule.tags.iter().map(|s| s.to_string()).collect(),
            confidence: score as u8,
            evidence,
        },
        _ => Analysis {
            service_type: "unknown".to_string(),
            vendor: "unknown".to_string(),
            product: "unknown".to_string(),
            version: None,
            tags: Vec::new(),
            confidence: 0,
            evidence: Vec::new(),
        },
    }
}
