//! Parsing for the `--ports` CLI flag: a comma-separated port list.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};

/// Parse a comma-separated port list into a deduplicated, order-preserving
/// `Vec<u16>`. Each entry must be a valid TCP port (1..=65535).
pub fn parse_ports_csv(s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for raw in s.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        let port: u32 = entry.parse().with_context(|| format!("invalid port value: {entry}"))?;
        if port == 0 || port > 65535 {
            bail!("port out of range: {port}");
        }
        if seen.insert(port as u16) {
            out.push(port as u16);
        }
    }

    Ok(out)
}

pub const DEFAULT_PORTS_CSV: &str = "80,443,22,21,8080,5900,554,3389";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_dedups() {
        let ports = parse_ports_csv("80,443,80,22").unwrap();
        assert_eq!(ports, vec![80, 443, 22]);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(parse_ports_csv("70000").is_err());
    }

    #[test]
    fn ignores_blank_entries() {
        let ports = parse_ports_csv("80,,443,").unwrap();
        assert_eq!(ports, vec![80, 443]);
    }

    #[test]
    fn default_list_parses() {
        let ports = parse_ports_csv(DEFAULT_PORTS_CSV).unwrap();
        assert_eq!(ports, vec![80, 443, 22, 21, 8080, 5900, 554, 3389]);
    }
}
