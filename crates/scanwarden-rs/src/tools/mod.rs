use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Replaced by the scan target when an invocation is rendered.
pub const TARGET_PLACEHOLDER: &str = "{target}";
/// Replaced by the target as an http(s) URL.
pub const URL_PLACEHOLDER: &str = "{url}";

/// The closed set of external scanners. Adding a variant forces a binary,
/// default arguments and a normalizer to be provided at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Nmap,
    Nuclei,
    Nikto,
    Testssl,
    Sslscan,
    Gobuster,
    Sqlmap,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::Nmap,
        ToolKind::Nuclei,
        ToolKind::Nikto,
        ToolKind::Testssl,
        ToolKind::Sslscan,
        ToolKind::Gobuster,
        ToolKind::Sqlmap,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Nmap => "nmap",
            ToolKind::Nuclei => "nuclei",
            ToolKind::Nikto => "nikto",
            ToolKind::Testssl => "testssl",
            ToolKind::Sslscan => "sslscan",
            ToolKind::Gobuster => "gobuster",
            ToolKind::Sqlmap => "sqlmap",
        }
    }

    /// Executable looked up on `PATH` unless overridden in the config.
    pub fn binary(self) -> &'static str {
        match self {
            ToolKind::Testssl => "testssl.sh",
            other => other.as_str(),
        }
    }

    pub fn default_timeout_secs(self) -> u64 {
        match self {
            ToolKind::Nmap => 300,
            ToolKind::Nuclei => 600,
            ToolKind::Nikto => 600,
            ToolKind::Testssl => 300,
            ToolKind::Sslscan => 120,
            ToolKind::Gobuster => 300,
            ToolKind::Sqlmap => 900,
        }
    }

    /// Argument vector used when a request names the tool without arguments.
    pub fn default_args(self, wordlist: &str) -> Vec<String> {
        let args: &[&str] = match self {
            ToolKind::Nmap => &["-sV", "-T4", "--top-ports", "1000", "-oX", "-", TARGET_PLACEHOLDER],
            ToolKind::Nuclei => &["-u", TARGET_PLACEHOLDER, "-jsonl", "-silent", "-nc"],
            ToolKind::Nikto => &["-h", TARGET_PLACEHOLDER, "-nointeractive", "-ask", "no"],
            ToolKind::Testssl => &["--quiet", "--color", "0", "--warnings", "off", TARGET_PLACEHOLDER],
            ToolKind::Sslscan => &["--no-colour", TARGET_PLACEHOLDER],
            ToolKind::Gobuster => {
                return vec![
                    "dir".into(),
                    "-u".into(),
                    URL_PLACEHOLDER.into(),
                    "-w".into(),
                    wordlist.to_string(),
                    "-q".into(),
                    "--no-color".into(),
                ]
            }
            ToolKind::Sqlmap => &["-u", URL_PLACEHOLDER, "--batch", "--disable-coloring"],
        };
        args.iter().map(|a| a.to_string()).collect()
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let kind = match name.as_str() {
            "nmap" => ToolKind::Nmap,
            "nuclei" => ToolKind::Nuclei,
            "nikto" | "nikto.pl" => ToolKind::Nikto,
            "testssl" | "testssl.sh" => ToolKind::Testssl,
            "sslscan" => ToolKind::Sslscan,
            "gobuster" => ToolKind::Gobuster,
            "sqlmap" => ToolKind::Sqlmap,
            _ => return Err(ScanError::UnknownTool(s.to_string())),
        };
        Ok(kind)
    }
}

/// One planned call of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationSpec {
    pub tool: ToolKind,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

impl ToolInvocationSpec {
    pub fn new(tool: ToolKind, args: Vec<String>, timeout_ms: u64) -> Self {
        Self {
            tool,
            args,
            timeout_ms,
        }
    }

    pub fn render_args(&self, target: &str) -> Vec<String> {
        render_args(&self.args, target)
    }

    pub fn mentions_target(&self) -> bool {
        self.args
            .iter()
            .any(|a| a.contains(TARGET_PLACEHOLDER) || a.contains(URL_PLACEHOLDER))
    }
}

/// Substitutes the placeholders. Each element stays a separate argv entry.
pub fn render_args(args: &[String], target: &str) -> Vec<String> {
    let url = target_url(target);
    args.iter()
        .map(|arg| {
            arg.replace(TARGET_PLACEHOLDER, target)
                .replace(URL_PLACEHOLDER, &url)
        })
        .collect()
}

fn target_url(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}
