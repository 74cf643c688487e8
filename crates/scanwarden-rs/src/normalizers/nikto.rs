use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Normalize};
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

static OSVDB_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(OSVDB-\d+):\s*").expect("valid OSVDB regex"));
static SEE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*See:\s*(\S+)\s*$").expect("valid See regex"));

/// Banner and statistics lines that are not findings.
const NOISE: &[&str] = &[
    "Target IP:",
    "Target Hostname:",
    "Target Port:",
    "Start Time:",
    "End Time:",
    "Server:",
    "SSL Info:",
    "host(s) tested",
    "requests:",
    "No CGI Directories found",
    "ERROR:",
];

/// Nikto plain-text report: one finding per `+ ` line.
pub struct NiktoNormalizer;

impl Normalize for NiktoNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let text = strip_ansi(&raw.stdout);
        let items: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix("+ "))
            .map(str::trim)
            .collect();

        if items.is_empty() {
            return Err(ParseError::Unexpected("no nikto report lines".into()));
        }

        Ok(items
            .into_iter()
            .filter(|item| !item.is_empty() && !NOISE.iter().any(|n| item.contains(n)))
            .map(parse_item)
            .collect())
    }
}

fn parse_item(item: &str) -> Vulnerability {
    let mut rest = item;
    let mut reference = None;

    if let Some(caps) = OSVDB_PREFIX.captures(rest) {
        reference = caps.get(1).map(|m| m.as_str().to_string());
        rest = &rest[caps[0].len()..];
    }

    let mut location = None;
    if rest.starts_with('/') {
        if let Some((path, message)) = rest.split_once(": ") {
            location = Some(path.to_string());
            rest = message;
        }
    }

    let mut message = rest.to_string();
    if let Some(caps) = SEE_URL.captures(rest) {
        if reference.is_none() {
            reference = caps.get(1).map(|m| m.as_str().to_string());
        }
        message = rest[..caps.get(0).map_or(rest.len(), |m| m.start())].to_string();
    }

    let mut vuln = Vulnerability::new(classify(&message), "nikto", title_of(&message))
        .with_description(message.clone());
    if let Some(reference) = reference {
        vuln = vuln.with_reference(reference);
    }
    if let Some(location) = location {
        vuln = vuln.with_location(location);
    }
    vuln
}

fn classify(message: &str) -> Severity {
    let m = message.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| m.contains(n));
    if any(&["sql injection", "remote code", "command execution", "cross-site scripting", "xss", "backdoor", "shell"]) {
        Severity::High
    } else if any(&["outdated", "cve-", "directory indexing", "vulnerable", "may allow"]) {
        Severity::Medium
    } else if any(&["header", "cookie", "default file", "login", "http method", "etag"]) {
        Severity::Low
    } else {
        Severity::Info
    }
}

fn title_of(message: &str) -> String {
    let sentence = message.split(". ").next().unwrap_or(message).trim_end_matches('.');
    if sentence.chars().count() > 100 {
        let cut: String = sentence.chars().take(97).collect();
        format!("{cut}...")
    } else {
        sentence.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const REPORT: &str = "- Nikto v2.5.0
---------------------------------------------------------------------------
+ Target IP:          45.33.32.156
+ Target Hostname:    scanme.nmap.org
+ Target Port:        80
+ Start Time:         2024-01-01 10:00:00 (GMT0)
---------------------------------------------------------------------------
+ Server: Apache/2.4.7 (Ubuntu)
+ /: The anti-clickjacking X-Frame-Options header is not present. See: https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/X-Frame-Options
+ No CGI Directories found (use '-C all' to force check all possible dirs)
+ Apache/2.4.7 appears to be outdated (current is at least Apache/2.4.54).
+ OSVDB-3233: /icons/README: Apache default file found.
+ 8102 requests: 0 error(s) and 3 item(s) reported on remote host
+ End Time:           2024-01-01 10:05:00 (GMT0) (300 seconds)
---------------------------------------------------------------------------
+ 1 host(s) tested";

    #[test]
    fn extracts_findings_and_skips_banner() {
        let findings = NiktoNormalizer.normalize(&raw(ToolKind::Nikto, REPORT));
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[0].location.as_deref(), Some("/"));
        assert_eq!(
            findings[0].reference.as_deref(),
            Some("https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/X-Frame-Options")
        );
        assert_eq!(findings[0].title, "The anti-clickjacking X-Frame-Options header is not present");

        assert_eq!(findings[1].severity, Severity::Medium);
        assert!(findings[1].location.is_none());

        assert_eq!(findings[2].reference.as_deref(), Some("OSVDB-3233"));
        assert_eq!(findings[2].location.as_deref(), Some("/icons/README"));
        assert_eq!(findings[2].severity, Severity::Low);
    }

    #[test]
    fn non_report_output_is_rejected() {
        let out = "nikto: command line error";
        assert!(NiktoNormalizer.parse(&raw(ToolKind::Nikto, out)).is_err());
    }
}
