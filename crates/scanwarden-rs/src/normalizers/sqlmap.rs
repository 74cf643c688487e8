use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Normalize};
use crate::{
    error::ParseError,
    models::{Severity, ToolExecutionResult, Vulnerability},
};

static PARAMETER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Parameter:\s*(.+?)\s*$").expect("valid parameter regex"));
static DBMS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^back-end DBMS:\s*(.+?)\s*$").expect("valid dbms regex"));

const OWASP_SQLI: &str = "https://owasp.org/www-community/attacks/SQL_Injection";

#[derive(Default)]
struct Technique {
    kind: String,
    title: String,
    payload: String,
}

/// sqlmap batch-mode console output. Each injection technique listed under a
/// `Parameter:` block becomes one finding.
pub struct SqlmapNormalizer;

impl Normalize for SqlmapNormalizer {
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError> {
        let text = strip_ansi(&raw.stdout);
        let mut findings = Vec::new();
        let mut parameter: Option<String> = None;
        let mut current: Option<Technique> = None;
        let mut dbms: Option<String> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed == "---" {
                flush(&mut findings, parameter.as_deref(), current.take());
                parameter = None;
                continue;
            }
            if let Some(caps) = PARAMETER.captures(trimmed) {
                flush(&mut findings, parameter.as_deref(), current.take());
                parameter = Some(caps[1].to_string());
                continue;
            }
            if parameter.is_some() {
                if let Some(kind) = trimmed.strip_prefix("Type:") {
                    flush(&mut findings, parameter.as_deref(), current.take());
                    current = Some(Technique {
                        kind: kind.trim().to_string(),
                        ..Technique::default()
                    });
                    continue;
                }
                if let Some(t) = current.as_mut() {
                    if let Some(title) = trimmed.strip_prefix("Title:") {
                        t.title = title.trim().to_string();
                    } else if let Some(payload) = trimmed.strip_prefix("Payload:") {
                        t.payload = payload.trim().to_string();
                    }
                }
                continue;
            }
            if let Some(caps) = DBMS.captures(trimmed) {
                dbms = Some(caps[1].to_string());
            }
        }
        flush(&mut findings, parameter.as_deref(), current.take());

        if let Some(dbms) = dbms {
            findings.push(
                Vulnerability::new(Severity::Info, "dbms-fingerprint", format!("Back-end DBMS identified: {dbms}"))
                    .with_description("sqlmap fingerprinted the database behind the target"),
            );
        }

        if findings.is_empty() && !text.contains("sqlmap") && !text.contains("[INFO]") {
            return Err(ParseError::Unexpected("not sqlmap output".into()));
        }
        Ok(findings)
    }
}

fn flush(findings: &mut Vec<Vulnerability>, parameter: Option<&str>, technique: Option<Technique>) {
    let (Some(parameter), Some(t)) = (parameter, technique) else {
        return;
    };
    let mut description = t.title;
    if !t.payload.is_empty() {
        if !description.is_empty() {
            description.push('\n');
        }
        description.push_str("Payload: ");
        description.push_str(&t.payload);
    }
    findings.push(
        Vulnerability::new(
            Severity::Critical,
            "sql-injection",
            format!("SQL injection in parameter {parameter}: {}", t.kind),
        )
        .with_description(description)
        .with_solution("Use parameterized queries and validate input server-side")
        .with_reference(OWASP_SQLI)
        .with_location(parameter),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalizers::raw, tools::ToolKind};

    const INJECTABLE: &str = "        ___
       __H__
 ___ ___[.]_____ ___ ___  {1.7.2#stable}
|_ -| . [(]     | .'| . |
|___|_  [']_|_|_|__,|  _|
      |_|V...       |_|   https://sqlmap.org

[10:00:00] [INFO] testing connection to the target URL
sqlmap identified the following injection point(s) with a total of 46 HTTP(s) requests:
---
Parameter: id (GET)
    Type: boolean-based blind
    Title: AND boolean-based blind - WHERE or HAVING clause
    Payload: id=1 AND 5523=5523

    Type: UNION query
    Title: Generic UNION query (NULL) - 3 columns
    Payload: id=-4242 UNION ALL SELECT NULL,NULL,NULL-- -
---
[10:00:05] [INFO] the back-end DBMS is MySQL
back-end DBMS: MySQL >= 5.0
";

    #[test]
    fn each_technique_is_a_critical_finding() {
        let findings = SqlmapNormalizer.normalize(&raw(ToolKind::Sqlmap, INJECTABLE));
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].title, "SQL injection in parameter id (GET): boolean-based blind");
        assert_eq!(findings[0].location.as_deref(), Some("id (GET)"));
        assert!(findings[0]
            .description
            .as_deref()
            .unwrap()
            .contains("Payload: id=1 AND 5523=5523"));

        assert_eq!(findings[1].title, "SQL injection in parameter id (GET): UNION query");

        assert_eq!(findings[2].severity, Severity::Info);
        assert_eq!(findings[2].title, "Back-end DBMS identified: MySQL >= 5.0");
    }

    #[test]
    fn clean_run_has_no_findings() {
        let out = "[10:00:00] [INFO] testing connection to the target URL\n\
                   [10:00:09] [CRITICAL] all tested parameters do not appear to be injectable.";
        assert!(SqlmapNormalizer.parse(&raw(ToolKind::Sqlmap, out)).unwrap().is_empty());
    }

    #[test]
    fn foreign_output_is_rejected() {
        assert!(SqlmapNormalizer.parse(&raw(ToolKind::Sqlmap, "python3: not found")).is_err());
    }
}
