use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ExecutionError, tools::ToolKind};

/// Exit code reported when the tool binary could not be found or executed.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when the spawn failed for any other reason.
pub const EXIT_SPAWN_FAILED: i32 = 126;
/// Exit code reported when the invocation hit its timeout.
pub const EXIT_TIMED_OUT: i32 = 124;
/// Exit code reported when the invocation was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Lenient mapping from the labels scanners print. Anything unknown is `Info`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding in the common schema. Only normalizers build these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Vulnerability {
    pub fn new(severity: Severity, kind: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity,
            kind: kind.into(),
            title: title.into(),
            description: None,
            solution: None,
            reference: None,
            location: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = non_empty(description.into());
        self
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = non_empty(solution.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = non_empty(reference.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = non_empty(location.into());
        self
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Outcome of one subprocess invocation. A non-zero exit is recorded, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub tool: ToolKind,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn exited(tool: ToolKind, exit_code: i32, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            tool,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success: exit_code == 0,
            timed_out: false,
            cancelled: false,
            error: None,
        }
    }

    /// Result for an invocation that did not run to a normal exit.
    pub fn from_error(
        tool: ToolKind,
        err: &ExecutionError,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        let (exit_code, timed_out, cancelled) = match err {
            ExecutionError::ToolNotFound { .. } => (EXIT_NOT_FOUND, false, false),
            ExecutionError::ExecutionTimeout { .. } => (EXIT_TIMED_OUT, true, false),
            ExecutionError::Cancelled { .. } => (EXIT_CANCELLED, false, true),
            _ => (EXIT_SPAWN_FAILED, false, false),
        };
        Self {
            tool,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success: false,
            timed_out,
            cancelled,
            error: Some(err.to_string()),
        }
    }

    /// An invocation that was never started because its scan was cancelled.
    pub fn skipped(tool: ToolKind) -> Self {
        Self::from_error(tool, &ExecutionError::Cancelled { tool }, String::new(), String::new(), 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn from_vulnerabilities<'a>(vulns: impl IntoIterator<Item = &'a Vulnerability>) -> Self {
        let mut counts = Self::default();
        for v in vulns {
            counts.record(v.severity);
        }
        counts
    }

    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Info => self.info += 1,
        }
    }

    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.info
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub total_tools: usize,
    pub successful_tools: usize,
    pub failed_tools: usize,
    pub timed_out_tools: usize,
    pub cancelled_tools: usize,
    pub counts_by_severity: SeverityCounts,
    pub total_execution_time_ms: u64,
}

/// Finalized, scan-wide result handed to persistence and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedScanResult {
    pub scan_id: String,
    pub tool_results: Vec<ToolExecutionResult>,
    pub vulnerabilities: Vec<Vulnerability>,
    pub summary: ScanSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed | ScanState::Cancelled)
    }

    pub fn can_transition_to(self, next: ScanState) -> bool {
        use ScanState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Pending => "PENDING",
            ScanState::Running => "RUNNING",
            ScanState::Completed => "COMPLETED",
            ScanState::Failed => "FAILED",
            ScanState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanPhase {
    Started,
    ToolStarted,
    ToolCompleted,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// Milestone emitted by the orchestrator. Serialises as the `scanUpdate` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub scan_id: String,
    pub phase: ScanPhase,
    pub status: ScanState,
    #[serde(rename = "progress")]
    pub percent: u8,
    #[serde(rename = "output")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolKind>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "vulnerabilities", default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities_so_far: Option<usize>,
}

impl ProgressEvent {
    pub fn new(scan_id: &str, phase: ScanPhase, status: ScanState, percent: u8, message: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            phase,
            status,
            percent: percent.min(100),
            message: message.into(),
            tool: None,
            timestamp: Utc::now(),
            vulnerabilities_so_far: None,
        }
    }

    pub fn with_tool(mut self, tool: ToolKind) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_vulnerabilities(mut self, count: usize) -> Self {
        self.vulnerabilities_so_far = Some(count);
        self
    }
}

/// Messages pushed on a scan's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ScanEvent {
    #[serde(rename = "scanUpdate")]
    ScanUpdate(ProgressEvent),
    #[serde(rename = "scanComplete")]
    ScanComplete {
        #[serde(rename = "scanId")]
        scan_id: String,
        results: AggregatedScanResult,
    },
    #[serde(rename = "scanError")]
    ScanError {
        #[serde(rename = "scanId")]
        scan_id: String,
        error: String,
    },
}

impl ScanEvent {
    pub fn scan_id(&self) -> &str {
        match self {
            ScanEvent::ScanUpdate(p) => &p.scan_id,
            ScanEvent::ScanComplete { scan_id, .. } | ScanEvent::ScanError { scan_id, .. } => scan_id,
        }
    }
}

/// Pull-based view of a scan, for callers that joined the channel late.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub scan_id: String,
    pub state: ScanState,
    pub percent: u8,
    pub vulnerabilities_so_far: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Scan row shape the persistence collaborator stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: String,
    pub status: ScanState,
    pub scan_type: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Serialized [`AggregatedScanResult`].
    pub results: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityRecord {
    pub scan_id: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub reference: Option<String>,
    pub location: Option<String>,
}

impl VulnerabilityRecord {
    pub fn from_vulnerability(scan_id: &str, v: &Vulnerability) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            severity: v.severity,
            kind: v.kind.clone(),
            title: v.title.clone(),
            description: v.description.clone(),
            solution: v.solution.clone(),
            reference: v.reference.clone(),
            location: v.location.clone(),
        }
    }
}
