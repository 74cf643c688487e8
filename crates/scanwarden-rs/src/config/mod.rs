use std::{collections::BTreeMap, env, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{error::ScanError, tools::ToolKind};

pub const CONFIG_PATH_VAR: &str = "SCANWARDEN_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "scanwarden.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Upper bound on concurrently running invocations inside one parallel scan.
    pub max_concurrent_invocations: usize,
    /// Keep vulnerabilities found before a cancel in the finalized result.
    pub retain_partial_on_cancel: bool,
    /// Time a signalled process gets between SIGTERM and SIGKILL.
    pub cancel_grace_ms: u64,
    pub tool_timeouts_secs: BTreeMap<ToolKind, u64>,
    pub tool_paths: BTreeMap<ToolKind, String>,
    pub wordlist: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: 4,
            retain_partial_on_cancel: true,
            cancel_grace_ms: 5_000,
            tool_timeouts_secs: BTreeMap::new(),
            tool_paths: BTreeMap::new(),
            wordlist: "/usr/share/wordlists/dirb/common.txt".to_string(),
        }
    }
}

impl AppConfig {
    /// File named by `SCANWARDEN_CONFIG` (or `scanwarden.json`), then `SW_*` overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_sources(Path::new(&path), |key| env::var(key).ok())
    }

    pub fn from_sources(path: &Path, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let file_cfg: Option<AppConfig> = fs::read_to_string(path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let mut cfg = file_cfg.unwrap_or_default();

        if let Some(v) = var("SW_MAX_CONCURRENCY") {
            cfg.max_concurrent_invocations = v.parse().context("invalid SW_MAX_CONCURRENCY")?;
        }
        if let Some(v) = var("SW_RETAIN_PARTIAL_ON_CANCEL") {
            cfg.retain_partial_on_cancel = v
                .parse()
                .context("invalid SW_RETAIN_PARTIAL_ON_CANCEL")?;
        }
        if let Some(v) = var("SW_CANCEL_GRACE_MS") {
            cfg.cancel_grace_ms = v.parse().context("invalid SW_CANCEL_GRACE_MS")?;
        }
        if let Some(v) = var("SW_WORDLIST") {
            cfg.wordlist = v;
        }
        for kind in ToolKind::ALL {
            let upper = kind.as_str().to_ascii_uppercase();
            if let Some(v) = var(&format!("SW_{upper}_PATH")) {
                cfg.tool_paths.insert(kind, v);
            }
            let timeout_var = format!("SW_{upper}_TIMEOUT_SECS");
            if let Some(v) = var(&timeout_var) {
                let secs = v.parse().with_context(|| format!("invalid {timeout_var}"))?;
                cfg.tool_timeouts_secs.insert(kind, secs);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.max_concurrent_invocations == 0 {
            return Err(ScanError::Configuration(
                "max_concurrent_invocations must be at least 1".into(),
            ));
        }
        if self.cancel_grace_ms == 0 {
            return Err(ScanError::Configuration("cancel_grace_ms must be greater than zero".into()));
        }
        if let Some((kind, _)) = self.tool_timeouts_secs.iter().find(|(_, secs)| **secs == 0) {
            return Err(ScanError::Configuration(format!(
                "timeout for {kind} must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn timeout_ms(&self, kind: ToolKind) -> u64 {
        let secs = self
            .tool_timeouts_secs
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_timeout_secs());
        secs.saturating_mul(1_000)
    }

    pub fn binary(&self, kind: ToolKind) -> &str {
        self.tool_paths
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.binary())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
