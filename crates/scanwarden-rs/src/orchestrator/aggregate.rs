use crate::models::{AggregatedScanResult, ScanSummary, SeverityCounts, ToolExecutionResult, Vulnerability};

/// In-flight result of one scan. Owned by the task running the scan.
#[derive(Debug)]
pub(crate) struct Aggregate {
    scan_id: String,
    tool_results: Vec<ToolExecutionResult>,
    vulnerabilities: Vec<Vulnerability>,
}

impl Aggregate {
    pub(crate) fn new(scan_id: &str, capacity: usize) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            tool_results: Vec::with_capacity(capacity),
            vulnerabilities: Vec::new(),
        }
    }

    /// Appends in completion order.
    pub(crate) fn record(&mut self, result: ToolExecutionResult, findings: Vec<Vulnerability>) {
        self.tool_results.push(result);
        self.vulnerabilities.extend(findings);
    }

    pub(crate) fn completed(&self) -> usize {
        self.tool_results.len()
    }

    pub(crate) fn vulnerability_count(&self) -> usize {
        self.vulnerabilities.len()
    }

    /// Freezes the aggregate. With `keep_vulnerabilities == false` the findings
    /// (and their counts) are dropped while every tool result is kept.
    pub(crate) fn finish(self, total_execution_time_ms: u64, keep_vulnerabilities: bool) -> AggregatedScanResult {
        let vulnerabilities = if keep_vulnerabilities {
            self.vulnerabilities
        } else {
            Vec::new()
        };
        let summary = summarize(&self.tool_results, &vulnerabilities, total_execution_time_ms);
        AggregatedScanResult {
            scan_id: self.scan_id,
            tool_results: self.tool_results,
            vulnerabilities,
            summary,
        }
    }
}

/// Counts are always derived from the slices given, so they cannot drift.
pub fn summarize(
    tool_results: &[ToolExecutionResult],
    vulnerabilities: &[Vulnerability],
    total_execution_time_ms: u64,
) -> ScanSummary {
    let successful_tools = tool_results.iter().filter(|r| r.success).count();
    ScanSummary {
        total_tools: tool_results.len(),
        successful_tools,
        failed_tools: tool_results.len() - successful_tools,
        timed_out_tools: tool_results.iter().filter(|r| r.timed_out).count(),
        cancelled_tools: tool_results.iter().filter(|r| r.cancelled).count(),
        counts_by_severity: SeverityCounts::from_vulnerabilities(vulnerabilities),
        total_execution_time_ms,
    }
}
