use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    config::AppConfig,
    error::ScanError,
    tools::{ToolInvocationSpec, ToolKind, TARGET_PLACEHOLDER, URL_PLACEHOLDER},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    FullScan,
    NetworkRecon,
    WebAppScan,
    SslAnalysis,
    DirectoryEnum,
    SqlInjectionTest,
}

impl ScanMode {
    pub const ALL: [ScanMode; 6] = [
        ScanMode::FullScan,
        ScanMode::NetworkRecon,
        ScanMode::WebAppScan,
        ScanMode::SslAnalysis,
        ScanMode::DirectoryEnum,
        ScanMode::SqlInjectionTest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::FullScan => "full-scan",
            ScanMode::NetworkRecon => "network-recon",
            ScanMode::WebAppScan => "web-app-scan",
            ScanMode::SslAnalysis => "ssl-analysis",
            ScanMode::DirectoryEnum => "directory-enum",
            ScanMode::SqlInjectionTest => "sql-injection-test",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim())
            .ok_or_else(|| ScanError::UnsupportedMode(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDiscipline {
    Parallel,
    Sequential,
}

/// Resolved invocations of one scan, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub discipline: ExecutionDiscipline,
    pub invocations: Vec<ToolInvocationSpec>,
}

impl ToolPlan {
    /// Parses the mode name and resolves it. Nothing is spawned on failure.
    pub fn resolve(mode: &str, cfg: &AppConfig) -> Result<Self, ScanError> {
        let mode: ScanMode = mode.parse()?;
        Self::for_mode(mode, cfg)
    }

    pub fn for_mode(mode: ScanMode, cfg: &AppConfig) -> Result<Self, ScanError> {
        use ExecutionDiscipline::{Parallel, Sequential};
        use ToolKind::*;

        let defaults = |kind: ToolKind| ToolInvocationSpec::new(kind, kind.default_args(&cfg.wordlist), cfg.timeout_ms(kind));
        let custom = |kind: ToolKind, args: &[&str]| {
            ToolInvocationSpec::new(kind, args.iter().map(|a| a.to_string()).collect(), cfg.timeout_ms(kind))
        };

        let plan = match mode {
            ScanMode::NetworkRecon => ToolPlan {
                discipline: Parallel,
                invocations: vec![
                    custom(Nmap, &["-sn", "-oX", "-", TARGET_PLACEHOLDER]),
                    custom(Nuclei, &["-version"]),
                ],
            },
            ScanMode::FullScan => ToolPlan {
                discipline: Parallel,
                invocations: [Nmap, Nuclei, Nikto, Testssl, Gobuster].map(defaults).to_vec(),
            },
            ScanMode::WebAppScan => ToolPlan {
                discipline: Parallel,
                invocations: [Nikto, Nuclei, Gobuster].map(defaults).to_vec(),
            },
            ScanMode::SslAnalysis => ToolPlan {
                discipline: Sequential,
                invocations: vec![defaults(Testssl), defaults(Sslscan)],
            },
            ScanMode::DirectoryEnum => ToolPlan {
                discipline: Sequential,
                invocations: vec![defaults(Gobuster)],
            },
            ScanMode::SqlInjectionTest => ToolPlan {
                discipline: Sequential,
                invocations: vec![
                    custom(Nuclei, &["-u", URL_PLACEHOLDER, "-tags", "sqli", "-jsonl", "-silent", "-nc"]),
                    defaults(Sqlmap),
                ],
            },
        };
        plan.validate()?;
        Ok(plan)
    }

    /// A plan must contain at least one invocation and only positive timeouts.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.invocations.is_empty() {
            return Err(ScanError::Configuration("tool plan is empty".into()));
        }
        if let Some(inv) = self.invocations.iter().find(|inv| inv.timeout_ms == 0) {
            return Err(ScanError::Configuration(format!(
                "timeout for {} must be greater than zero",
                inv.tool
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_resolves_to_a_valid_plan() {
        let cfg = AppConfig::default();
        for mode in ScanMode::ALL {
            let plan = ToolPlan::for_mode(mode, &cfg).unwrap();
            assert!(!plan.is_empty(), "{mode}");
            assert_eq!(ToolPlan::resolve(mode.as_str(), &cfg).unwrap(), plan);
        }
    }

    #[test]
    fn network_recon_is_a_parallel_ping_scan_and_version_check() {
        let plan = ToolPlan::resolve("network-recon", &AppConfig::default()).unwrap();
        assert_eq!(plan.discipline, ExecutionDiscipline::Parallel);
        let tools: Vec<ToolKind> = plan.invocations.iter().map(|i| i.tool).collect();
        assert_eq!(tools, vec![ToolKind::Nmap, ToolKind::Nuclei]);
        assert_eq!(plan.invocations[0].render_args("scanme.nmap.org"), vec!["-sn", "-oX", "-", "scanme.nmap.org"]);
        assert_eq!(plan.invocations[1].args, vec!["-version"]);
    }

    #[test]
    fn ssl_analysis_runs_testssl_then_sslscan() {
        let plan = ToolPlan::resolve("ssl-analysis", &AppConfig::default()).unwrap();
        assert_eq!(plan.discipline, ExecutionDiscipline::Sequential);
        let tools: Vec<ToolKind> = plan.invocations.iter().map(|i| i.tool).collect();
        assert_eq!(tools, vec![ToolKind::Testssl, ToolKind::Sslscan]);
    }

    #[test]
    fn plan_uses_configured_timeouts() {
        let mut cfg = AppConfig::default();
        cfg.tool_timeouts_secs.insert(ToolKind::Nmap, 7);
        let plan = ToolPlan::for_mode(ScanMode::NetworkRecon, &cfg).unwrap();
        assert_eq!(plan.invocations[0].timeout_ms, 7_000);
        assert_eq!(plan.invocations[1].timeout_ms, cfg.timeout_ms(ToolKind::Nuclei));
    }

    #[test]
    fn unknown_mode_is_unsupported() {
        let err = ToolPlan::resolve("port-knock", &AppConfig::default()).unwrap_err();
        assert!(matches!(err, ScanError::UnsupportedMode(m) if m == "port-knock"));
    }

    #[test]
    fn zero_timeout_plan_is_rejected() {
        let plan = ToolPlan {
            discipline: ExecutionDiscipline::Sequential,
            invocations: vec![ToolInvocationSpec::new(ToolKind::Nmap, vec![], 0)],
        };
        assert!(matches!(plan.validate(), Err(ScanError::Configuration(_))));
    }
}
