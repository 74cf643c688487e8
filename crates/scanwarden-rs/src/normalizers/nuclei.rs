use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::Normalize;
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

#[derive(Debug, Deserialize)]
struct NucleiOutput {
    #[serde(rename = "template-id")]
    template_id: Option<String>,
    #[serde(default)]
    info: NucleiInfo,
    #[serde(rename = "matched-at")]
    matched_at: Option<String>,
    host: Option<String>,
    #[serde(rename = "matcher-name")]
    matcher_name: Option<String>,
    #[serde(rename = "extracted-results")]
    extracted_results: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct NucleiInfo {
    name: Option<String>,
    severity: Option<String>,
    description: Option<String>,
    remediation: Option<String>,
    /// A string or a list of strings depending on the template.
    reference: Option<Value>,
}

/// Nuclei JSON lines (`-jsonl`). Lines that are not findings, such as the
/// banner printed by `-version`, are skipped.
pub struct NucleiNormalizer;

impl Normalize for NucleiNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let mut findings = Vec::new();
        let mut skipped = 0usize;

        for line in raw.stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with('{') {
                skipped += 1;
                continue;
            }
            match serde_json::from_str::<NucleiOutput>(line) {
                Ok(hit) if hit.template_id.as_deref().is_some_and(|t| !t.is_empty()) => {
                    findings.push(to_vulnerability(hit))
                }
                // stats and error records share the stream but name no template
                Ok(_) => {
                    debug!("skipping nuclei record without a template id");
                    skipped += 1;
                }
                Err(e) => {
                    debug!(error = %e, "skipping unparseable nuclei line");
                    skipped += 1;
                }
            }
        }

        if findings.is_empty() && skipped > 0 {
            debug!(skipped, "nuclei produced no JSON findings");
        }
        Ok(findings)
    }
}

fn to_vulnerability(hit: NucleiOutput) -> Vulnerability {
    let template = hit.template_id.unwrap_or_default();
    let severity = hit
        .info
        .severity
        .as_deref()
        .map(Severity::from_label)
        .unwrap_or(Severity::Info);
    let mut title = hit.info.name.unwrap_or_else(|| template.clone());
    if let Some(matcher) = hit.matcher_name {
        title = format!("{title} [{matcher}]");
    }

    let mut description = hit.info.description.unwrap_or_default();
    if let Some(extracted) = hit.extracted_results.filter(|e| !e.is_empty()) {
        if !description.is_empty() {
            description.push('\n');
        }
        description.push_str("Extracted: ");
        description.push_str(&extracted.join(", "));
    }

    let mut vuln = Vulnerability::new(severity, template, title).with_description(description);
    if let Some(fix) = hit.info.remediation {
        vuln = vuln.with_solution(fix);
    }
    if let Some(reference) = hit.info.reference.as_ref().and_then(first_reference) {
        vuln = vuln.with_reference(reference);
    }
    if let Some(location) = hit.matched_at.or(hit.host) {
        vuln = vuln.with_location(location);
    }
    vuln
}

fn first_reference(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const JSONL: &str = r#"{"template-id":"CVE-2021-41773","info":{"name":"Apache 2.4.49 Path Traversal","severity":"critical","description":"Path traversal in Apache HTTP Server 2.4.49","remediation":"Upgrade to 2.4.51","reference":["https://nvd.nist.gov/vuln/detail/CVE-2021-41773"]},"type":"http","host":"http://target","matched-at":"http://target/cgi-bin/.%2e/etc/passwd"}
{"template-id":"tech-detect","info":{"name":"Wappalyzer Technology Detection","severity":"info","reference":null},"matcher-name":"nginx","host":"http://target","matched-at":"http://target"}
{"template-id":"broken","info":
{"template-id":"missing-headers","info":{"name":"HTTP Missing Security Headers","severity":"unknown","reference":"https://owasp.org/www-project-secure-headers/"},"extracted-results":["x-frame-options"],"host":"http://target"}"#;

    #[test]
    fn parses_each_json_line() {
        let findings = NucleiNormalizer.normalize(&raw(ToolKind::Nuclei, JSONL));
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].kind, "CVE-2021-41773");
        assert_eq!(findings[0].solution.as_deref(), Some("Upgrade to 2.4.51"));
        assert_eq!(
            findings[0].reference.as_deref(),
            Some("https://nvd.nist.gov/vuln/detail/CVE-2021-41773")
        );

        assert_eq!(findings[1].title, "Wappalyzer Technology Detection [nginx]");
        assert!(findings[1].reference.is_none());

        assert_eq!(findings[2].severity, Severity::Info);
        assert_eq!(findings[2].location.as_deref(), Some("http://target"));
        assert!(findings[2].description.as_deref().unwrap().contains("x-frame-options"));
    }

    #[test]
    fn version_banner_yields_no_findings() {
        let banner = "[INF] Nuclei Engine Version: v3.1.0\n[INF] Nuclei Config Directory: /root/.config/nuclei";
        assert!(NucleiNormalizer.normalize(&raw(ToolKind::Nuclei, banner)).is_empty());
    }

    #[test]
    fn records_without_template_id_are_not_findings() {
        let stream = r#"{"duration":"0:00:05","errors":"0","hosts":"1","matched":"1","percent":"100","requests":"412"}
{"error":"context deadline exceeded","address":"target:443"}
{"template-id":"","info":{"name":"blank"}}
{"template-id":"git-config","info":{"name":"Git Config File","severity":"medium"},"matched-at":"http://target/.git/config"}"#;
        let findings = NucleiNormalizer.normalize(&raw(ToolKind::Nuclei, stream));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "git-config");
        assert_eq!(findings[0].severity, Severity::Medium);
    }
}
