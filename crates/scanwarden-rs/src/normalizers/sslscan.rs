use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Normalize};
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

static PROTOCOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(SSLv2|SSLv3|TLSv1\.0|TLSv1\.1)\s+enabled").expect("valid protocol regex"));
static CIPHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(Preferred|Accepted)\s+(\S+)\s+(\d+)\s+bits\s+(\S+)").expect("valid cipher regex")
});
static KEY_STRENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^RSA Key Strength:\s+(\d+)").expect("valid key strength regex"));

const MARKERS: &[&str] = &["Testing SSL server", "SSL/TLS Protocols", "Supported Server Cipher"];

/// sslscan text output (`--no-colour`).
pub struct SslscanNormalizer;

impl Normalize for SslscanNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let text = strip_ansi(&raw.stdout);
        if !MARKERS.iter().any(|m| text.contains(m)) {
            return Err(ParseError::Unexpected("not an sslscan report".into()));
        }

        let mut findings = Vec::new();
        for line in text.lines().map(str::trim) {
            if let Some(vuln) = assess_line(line) {
                findings.push(vuln);
            }
        }
        Ok(findings)
    }
}

fn assess_line(line: &str) -> Option<Vulnerability> {
    if let Some(caps) = PROTOCOL.captures(line) {
        let proto = &caps[1];
        let severity = if proto.starts_with("SSL") { Severity::High } else { Severity::Medium };
        return Some(
            Vulnerability::new(severity, "tls-protocol", format!("{proto} enabled"))
                .with_description(format!("Server accepts the deprecated {proto} protocol"))
                .with_solution("Disable legacy SSL/TLS protocol versions"),
        );
    }

    if line.contains("vulnerable to heartbleed") && !line.contains("not vulnerable") {
        return Some(
            Vulnerability::new(Severity::Critical, "tls-vulnerability", "Heartbleed")
                .with_description(line)
                .with_solution("Upgrade OpenSSL and rotate private keys")
                .with_reference("CVE-2014-0160"),
        );
    }

    if line.starts_with("Insecure session renegotiation supported") {
        return Some(
            Vulnerability::new(Severity::Medium, "tls-configuration", "Insecure session renegotiation")
                .with_description(line)
                .with_solution("Disable client-initiated insecure renegotiation")
                .with_reference("CVE-2009-3555"),
        );
    }

    if line.starts_with("Compression enabled") {
        return Some(
            Vulnerability::new(Severity::Medium, "tls-configuration", "TLS compression enabled")
                .with_description(line)
                .with_solution("Disable TLS compression")
                .with_reference("CVE-2012-4929"),
        );
    }

    if line.starts_with("Server does not support TLS Fallback SCSV") {
        return Some(
            Vulnerability::new(Severity::Low, "tls-configuration", "TLS Fallback SCSV not supported")
                .with_description(line)
                .with_solution("Enable TLS_FALLBACK_SCSV"),
        );
    }

    if let Some(caps) = CIPHER.captures(line) {
        let bits: u32 = caps[3].parse().unwrap_or(0);
        return weak_cipher(&caps[2], bits, &caps[4]);
    }

    if let Some(algorithm) = line.strip_prefix("Signature Algorithm:") {
        let algorithm = algorithm.trim();
        let lower = algorithm.to_ascii_lowercase();
        if lower.starts_with("sha1") || lower.starts_with("md5") {
            return Some(
                Vulnerability::new(Severity::Low, "tls-certificate", "Weak certificate signature algorithm")
                    .with_description(format!("Certificate signed with {algorithm}"))
                    .with_solution("Reissue the certificate with a SHA-256 signature"),
            );
        }
        return None;
    }

    if let Some(caps) = KEY_STRENGTH.captures(line) {
        let bits: u32 = caps[1].parse().unwrap_or(0);
        if bits < 2048 {
            return Some(
                Vulnerability::new(Severity::Medium, "tls-certificate", "Weak RSA key")
                    .with_description(format!("Certificate RSA key is {bits} bits"))
                    .with_solution("Use an RSA key of at least 2048 bits"),
            );
        }
    }

    None
}

fn weak_cipher(protocol: &str, bits: u32, name: &str) -> Option<Vulnerability> {
    let upper = name.to_ascii_uppercase();
    let broken = ["NULL", "EXP", "ADH-", "AECDH", "ANON"].iter().any(|n| upper.contains(n));
    let weak = bits < 128 || ["RC4", "DES", "MD5"].iter().any(|n| upper.contains(n));

    let severity = if broken {
        Severity::High
    } else if weak {
        Severity::Medium
    } else {
        return None;
    };
    Some(
        Vulnerability::new(severity, "weak-cipher", format!("Weak cipher {name} ({protocol})"))
            .with_description(format!("{protocol} cipher suite {name} with {bits}-bit strength is accepted"))
            .with_solution("Restrict the server to AEAD cipher suites"),
    )
}
