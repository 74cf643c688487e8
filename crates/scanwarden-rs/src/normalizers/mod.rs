//! Per-tool conversion of raw output into [`Vulnerability`] records.
//!
//! Every [`ToolKind`] maps to exactly one normalizer through an exhaustive
//! `match`, so a tool without a parser does not compile.

mod gobuster;
mod nikto;
mod nmap;
mod nuclei;
mod sqlmap;
mod sslscan;
mod testssl;

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

pub use self::{
    gobuster::GobusterNormalizer, nikto::NiktoNormalizer, nmap::NmapNormalizer,
    nuclei::NucleiNormalizer, sqlmap::SqlmapNormalizer, sslscan::SslscanNormalizer,
    testssl::TestsslNormalizer,
};
use crate::{
    error::ParseError,
    models::{ToolExecutionResult, Vulnerability},
    tools::ToolKind,
};

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

pub trait Normalize: Send + Sync {
    /// Tool-specific parsing. May fail; callers go through [`Normalize::normalize`].
    fn parse(&self, raw: &ToolExecutionResult) -> Result<Vec<Vulnerability>, ParseError>;

    /// Total: malformed or empty output yields no findings and a warning.
    fn normalize(&self, raw: &ToolExecutionResult) -> Vec<Vulnerability> {
        if raw.stdout.trim().is_empty() {
            return Vec::new();
        }
        match self.parse(raw) {
            Ok(findings) => findings,
            Err(e) => {
                warn!(
                    tool = %raw.tool,
                    exit_code = raw.exit_code,
                    timed_out = raw.timed_out,
                    error = %e,
                    "unparseable tool output, recording no findings"
                );
                Vec::new()
            }
        }
    }
}

pub fn normalizer_for(kind: ToolKind) -> &'static dyn Normalize {
    match kind {
        ToolKind::Nmap => &NmapNormalizer,
        ToolKind::Nuclei => &NucleiNormalizer,
        ToolKind::Nikto => &NiktoNormalizer,
        ToolKind::Testssl => &TestsslNormalizer,
        ToolKind::Sslscan => &SslscanNormalizer,
        ToolKind::Gobuster => &GobusterNormalizer,
        ToolKind::Sqlmap => &SqlmapNormalizer,
    }
}

pub fn normalize(raw: &ToolExecutionResult) -> Vec<Vulnerability> {
    normalizer_for(raw.tool).normalize(raw)
}

pub(crate) fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

#[cfg(test)]
pub(crate) fn raw(tool: ToolKind, stdout: &str) -> ToolExecutionResult {
    ToolExecutionResult::exited(tool, 0, stdout.to_string(), String::new(), 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_never_escapes_any_normalizer() {
        let inputs = ["", "   \n", "\u{0}\u{1}binary", "<nmaprun><host>", "{\"template-id\": ", "+ \n+"];
        for kind in ToolKind::ALL {
            for input in inputs {
                let _ = normalize(&raw(kind, input));
            }
        }
    }

    #[test]
    fn empty_output_yields_nothing() {
        for kind in ToolKind::ALL {
            assert!(normalize(&raw(kind, "")).is_empty(), "{kind}");
        }
    }

    #[test]
    fn ansi_codes_are_removed() {
        assert_eq!(strip_ansi("\x1b[1;31mVULNERABLE\x1b[m (NOT ok)"), "VULNERABLE (NOT ok)");
    }
}
