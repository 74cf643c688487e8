use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Normalize};
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

/// `label   verdict` rows, separated by two or more spaces.
static ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\S.*?)\s{2,}(\S.*)$").expect("valid row regex"));
static CVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"CVE-\d{4}-\d{4,}").expect("valid CVE regex"));

/// testssl.sh plain-text output (`--color 0`).
pub struct TestsslNormalizer;

impl Normalize for TestsslNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let text = strip_ansi(&raw.stdout);
        let mut rows = 0usize;
        let mut findings = Vec::new();

        for line in text.lines() {
            let Some(caps) = ROW.captures(line) else {
                continue;
            };
            rows += 1;
            let label = caps[1].trim();
            let verdict = caps[2].trim();
            if let Some(vuln) = assess(label, verdict) {
                findings.push(vuln);
            }
        }

        if rows == 0 {
            return Err(ParseError::Unexpected("no testssl result rows".into()));
        }
        Ok(findings)
    }
}

fn assess(label: &str, verdict: &str) -> Option<Vulnerability> {
    let lower = verdict.to_ascii_lowercase();
    if lower.contains("not vulnerable") {
        return None;
    }

    let (severity, kind) = if verdict.contains("potentially VULNERABLE") {
        (Severity::Medium, "tls-vulnerability")
    } else if verdict.contains("VULNERABLE") {
        if lower.contains("likely mitigated") {
            (Severity::Low, "tls-vulnerability")
        } else {
            (Severity::High, "tls-vulnerability")
        }
    } else if verdict.contains("NOT ok") {
        if label.starts_with("SSLv2") || label.starts_with("SSLv3") {
            (Severity::High, "tls-protocol")
        } else {
            (Severity::Medium, "tls-configuration")
        }
    } else if label.starts_with("Certificate Validity") && lower.contains("expired") {
        (Severity::High, "tls-certificate")
    } else if lower.contains("(deprecated)") {
        (Severity::Low, "tls-protocol")
    } else {
        return None;
    };

    let mut vuln = Vulnerability::new(severity, kind, label)
        .with_description(verdict)
        .with_solution(solution_for(kind));
    if let Some(cve) = CVE.find(label) {
        vuln = vuln.with_reference(cve.as_str());
    }
    Some(vuln)
}

fn solution_for(kind: &str) -> &'static str {
    match kind {
        "tls-protocol" => "Disable legacy SSL/TLS protocol versions",
        "tls-certificate" => "Renew the certificate",
        _ => "Update the TLS stack and restrict the server configuration",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const OUTPUT: &str = "
 Testing protocols via sockets except NPN+ALPN

 SSLv2      not offered (OK)
 SSLv3      offered (NOT ok)
 TLS 1      offered (deprecated)
 TLS 1.2    offered (OK)

 Testing vulnerabilities

 Heartbleed (CVE-2014-0160)                not vulnerable (OK), no heartbeat extension
 POODLE, SSL (CVE-2014-3566)               VULNERABLE (NOT ok), uses SSLv3+CBC
 BEAST (CVE-2011-3389)                     TLS1: ECDHE-RSA-AES128-SHA VULNERABLE -- but also supports higher protocols (likely mitigated)
 LUCKY13 (CVE-2013-0169), experimental     potentially VULNERABLE, uses cipher block chaining (CBC) ciphers with TLS
";

    #[test]
    fn reports_vulnerable_and_not_ok_rows() {
        let findings = TestsslNormalizer.normalize(&raw(ToolKind::Testssl, OUTPUT));
        let titles: Vec<&str> = findings.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "SSLv3",
                "TLS 1",
                "POODLE, SSL (CVE-2014-3566)",
                "BEAST (CVE-2011-3389)",
                "LUCKY13 (CVE-2013-0169), experimental",
            ]
        );
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[1].severity, Severity::Low);
        assert_eq!(findings[2].severity, Severity::High);
        assert_eq!(findings[2].reference.as_deref(), Some("CVE-2014-3566"));
        assert_eq!(findings[3].severity, Severity::Low);
        assert_eq!(findings[4].severity, Severity::Medium);
    }

    #[test]
    fn coloured_output_is_handled() {
        let out = " SSLv3      \x1b[1;31moffered (NOT ok)\x1b[m\n";
        let findings = TestsslNormalizer.normalize(&raw(ToolKind::Testssl, out));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].description.as_deref(), Some("offered (NOT ok)"));
    }

    #[test]
    fn unrelated_output_is_a_parse_error() {
        assert!(TestsslNormalizer
            .parse(&raw(ToolKind::Testssl, "Fatal error: openssl not found"))
            .is_err());
    }
}
