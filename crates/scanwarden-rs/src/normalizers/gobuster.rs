use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Normalize};
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

static ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(/\S*)\s+\(Status:\s*(\d{3})\)(?:\s*\[Size:\s*(\d+)\])?(?:\s*\[-->\s*(\S+)\])?")
        .expect("valid gobuster regex")
});

/// Paths that leak source, credentials or backups.
const SENSITIVE: &[&str] = &[
    ".git", ".svn", ".env", ".htpasswd", ".htaccess", ".bak", ".sql", ".old", "backup", "wp-config",
    "config.php", ".ds_store",
];
/// Administrative surfaces worth a second look.
const ADMIN: &[&str] = &["admin", "phpmyadmin", "manager", "console", "server-status", "debug"];

/// Gobuster `dir` mode output.
pub struct GobusterNormalizer;

impl Normalize for GobusterNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let text = strip_ansi(&raw.stdout);
        // progress updates are carriage-return separated on the same line
        let findings: Vec<Vulnerability> = text
            .split(['\n', '\r'])
            .filter_map(|line| ENTRY.captures(line.trim()))
            .map(|caps| {
                let status: u16 = caps[2].parse().unwrap_or(0);
                entry(
                    &caps[1],
                    status,
                    caps.get(3).map(|m| m.as_str()),
                    caps.get(4).map(|m| m.as_str()),
                )
            })
            .collect();

        if findings.is_empty() {
            return Err(ParseError::Unexpected("no gobuster result lines".into()));
        }
        Ok(findings)
    }
}

fn entry(path: &str, status: u16, size: Option<&str>, redirect: Option<&str>) -> Vulnerability {
    let lower = path.to_ascii_lowercase();
    let reachable = (200..300).contains(&status);
    let guarded = status == 401 || status == 403;

    let (severity, kind) = if SENSITIVE.iter().any(|s| lower.contains(s)) {
        match (reachable, guarded) {
            (true, _) => (Severity::High, "sensitive-file"),
            (_, true) => (Severity::Medium, "sensitive-file"),
            _ => (Severity::Low, "sensitive-file"),
        }
    } else if ADMIN.iter().any(|s| lower.contains(s)) {
        if reachable {
            (Severity::Medium, "admin-interface")
        } else {
            (Severity::Low, "admin-interface")
        }
    } else if reachable {
        (Severity::Low, "discovered-path")
    } else {
        (Severity::Info, "discovered-path")
    };

    let mut description = format!("HTTP {status}");
    if let Some(size) = size {
        description.push_str(&format!(", {size} bytes"));
    }
    if let Some(target) = redirect {
        description.push_str(&format!(", redirects to {target}"));
    }

    let mut vuln = Vulnerability::new(severity, kind, format!("Discovered path {path} ({status})"))
        .with_description(description)
        .with_location(path);
    if kind == "sensitive-file" {
        vuln = vuln.with_solution("Remove the file from the web root or deny access to it");
    }
    vuln
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const OUTPUT: &str = "/admin                (Status: 301) [Size: 0] [--> /admin/]
/.git/HEAD            (Status: 200) [Size: 23]
/index.html           (Status: 200) [Size: 1024]
\rProgress: 4614 / 4615 (99.98%)\r/server-status        (Status: 403) [Size: 278]
/images               (Status: 301)
";

    #[test]
    fn classifies_discovered_paths() {
        let findings = GobusterNormalizer.normalize(&raw(ToolKind::Gobuster, OUTPUT));
        assert_eq!(findings.len(), 5);

        assert_eq!(findings[0].kind, "admin-interface");
        assert_eq!(findings[0].severity, Severity::Low);
        assert!(findings[0].description.as_deref().unwrap().contains("redirects to /admin/"));

        assert_eq!(findings[1].kind, "sensitive-file");
        assert_eq!(findings[1].severity, Severity::High);
        assert_eq!(findings[1].location.as_deref(), Some("/.git/HEAD"));

        assert_eq!(findings[2].severity, Severity::Low);
        assert_eq!(findings[3].title, "Discovered path /server-status (403)");
        assert_eq!(findings[4].severity, Severity::Info);
    }

    #[test]
    fn wildcard_error_is_unparseable() {
        let out = "Error: the server returns a status code that matches the provided options for non existing urls";
        assert!(GobusterNormalizer.parse(&raw(ToolKind::Gobuster, out)).is_err());
        assert!(GobusterNormalizer.normalize(&raw(ToolKind::Gobuster, out)).is_empty());
    }
}
