//! Request/response shapes for single and multi-tool execution, served by
//! whatever transport hosts the core.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ScanError,
    executor::{check_request, CancelToken, ToolRunner},
    models::ToolExecutionResult,
    orchestrator::{run_invocations, summarize},
    plan::{ExecutionDiscipline, ToolPlan},
    tools::{ToolInvocationSpec, ToolKind, TARGET_PLACEHOLDER},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionRequest {
    pub tool: String,
    pub target: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Milliseconds. Falls back to the tool's configured timeout.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResponse {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_code: i32,
    pub execution_time: u64,
}

impl From<&ToolExecutionResult> for ToolExecutionResponse {
    fn from(result: &ToolExecutionResult) -> Self {
        let error = result
            .error
            .clone()
            .or_else(|| (!result.success && !result.stderr.trim().is_empty()).then(|| result.stderr.clone()));
        Self {
            success: result.success,
            output: result.stdout.clone(),
            error,
            exit_code: result.exit_code,
            execution_time: result.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolSelection {
    pub name: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiToolRequest {
    pub tools: Vec<ToolSelection>,
    pub target: String,
    #[serde(default = "default_discipline")]
    pub mode: ExecutionDiscipline,
}

fn default_discipline() -> ExecutionDiscipline {
    ExecutionDiscipline::Parallel
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub tool: ToolKind,
    pub timed_out: bool,
    #[serde(flatten)]
    pub response: ToolExecutionResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiToolSummary {
    pub total_tools: usize,
    pub successful_tools: usize,
    pub failed_tools: usize,
    pub total_execution_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiToolResponse {
    pub results: Vec<ToolResultEntry>,
    pub summary: MultiToolSummary,
}

/// Caller-supplied arguments, or the tool defaults. Arguments that never
/// mention the target get it appended as the last argv entry.
pub fn resolve_args(kind: ToolKind, args: Option<Vec<String>>, cfg: &AppConfig) -> Vec<String> {
    let Some(args) = args else {
        return kind.default_args(&cfg.wordlist);
    };
    let spec = ToolInvocationSpec::new(kind, args, 1);
    let append_target = !spec.mentions_target();
    let mut args = spec.args;
    if append_target {
        args.push(TARGET_PLACEHOLDER.to_string());
    }
    args
}

pub async fn execute_tool(
    runner: &dyn ToolRunner,
    cfg: &AppConfig,
    req: ToolExecutionRequest,
) -> Result<ToolExecutionResponse, ScanError> {
    let kind: ToolKind = req.tool.parse()?;
    let timeout_ms = req.timeout.unwrap_or_else(|| cfg.timeout_ms(kind));
    check_request(kind, &req.target, timeout_ms)?;

    let args = resolve_args(kind, req.args, cfg);
    info!(tool = %kind, target = %req.target, timeout_ms, "tool execution requested");
    let result = runner
        .execute(kind, &args, &req.target, timeout_ms, &CancelToken::new())
        .await?;
    Ok(ToolExecutionResponse::from(&result))
}

/// Runs the selected tools under the requested discipline with the same
/// engine as scans. Every selection yields exactly one result entry.
pub async fn execute_tools(
    runner: &dyn ToolRunner,
    cfg: &AppConfig,
    req: MultiToolRequest,
    cancel: &CancelToken,
) -> Result<MultiToolResponse, ScanError> {
    let invocations = req
        .tools
        .into_iter()
        .map(|selection| -> Result<ToolInvocationSpec, ScanError> {
            let kind: ToolKind = selection.name.parse()?;
            Ok(ToolInvocationSpec::new(
                kind,
                resolve_args(kind, selection.args, cfg),
                cfg.timeout_ms(kind),
            ))
        })
        .collect::<Result<Vec<_>, ScanError>>()?;
    let plan = ToolPlan {
        discipline: req.mode,
        invocations,
    };
    plan.validate()?;
    for spec in &plan.invocations {
        check_request(spec.tool, &req.target, spec.timeout_ms)?;
    }

    info!(target = %req.target, tools = plan.len(), discipline = ?plan.discipline, "multi-tool execution requested");
    let mut results: Vec<ToolExecutionResult> = Vec::with_capacity(plan.len());
    let total_ms = run_invocations(
        runner,
        &plan,
        &req.target,
        cancel,
        cfg.max_concurrent_invocations,
        |_| {},
        |_, result| results.push(result),
    )
    .await;

    let summary = summarize(&results, &[], total_ms);
    Ok(MultiToolResponse {
        results: results
            .iter()
            .map(|r| ToolResultEntry {
                tool: r.tool,
                timed_out: r.timed_out,
                response: ToolExecutionResponse::from(r),
            })
            .collect(),
        summary: MultiToolSummary {
            total_tools: summary.total_tools,
            successful_tools: summary.successful_tools,
            failed_tools: summary.failed_tools,
            total_execution_time: summary.total_execution_time_ms,
        },
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{error::ExecutionError, tools::render_args};

    /// Echoes the rendered argv on stdout; `sqlmap` exits 1.
    struct EchoRunner;

    #[async_trait::async_trait]
    impl ToolRunner for EchoRunner {
        async fn execute(
            &self,
            tool: ToolKind,
            args: &[String],
            target: &str,
            timeout_ms: u64,
            _cancel: &CancelToken,
        ) -> Result<ToolExecutionResult, ExecutionError> {
            check_request(tool, target, timeout_ms)?;
            let code = if tool == ToolKind::Sqlmap { 1 } else { 0 };
            Ok(ToolExecutionResult::exited(
                tool,
                code,
                render_args(args, target).join(" "),
                if code == 0 { String::new() } else { "boom".into() },
                3,
            ))
        }
    }

    fn request(tool: &str, args: Option<Vec<&str>>, timeout: Option<u64>) -> ToolExecutionRequest {
        ToolExecutionRequest {
            tool: tool.into(),
            target: "example.com".into(),
            args: args.map(|a| a.into_iter().map(String::from).collect()),
            timeout,
        }
    }

    #[tokio::test]
    async fn custom_args_get_target_appended() {
        let cfg = AppConfig::default();
        let resp = execute_tool(&EchoRunner, &cfg, request("nmap", Some(vec!["-sn"]), None))
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.output, "-sn example.com");
        assert_eq!(resp.execution_time, 3);
    }

    #[tokio::test]
    async fn placeholder_args_are_used_as_given() {
        let cfg = AppConfig::default();
        let resp = execute_tool(&EchoRunner, &cfg, request("nmap", Some(vec!["{target}", "-p", "80"]), None))
            .await
            .unwrap();
        assert_eq!(resp.output, "example.com -p 80");
    }

    #[tokio::test]
    async fn request_validation() {
        let cfg = AppConfig::default();
        assert_matches!(
            execute_tool(&EchoRunner, &cfg, request("msfconsole", None, None)).await,
            Err(ScanError::UnknownTool(_))
        );
        assert_matches!(
            execute_tool(&EchoRunner, &cfg, request("nmap", None, Some(0))).await,
            Err(ScanError::Configuration(_))
        );
    }

    #[tokio::test]
    async fn sequential_multi_tool_keeps_order_and_summarizes() {
        let cfg = AppConfig::default();
        let req = MultiToolRequest {
            tools: vec![
                ToolSelection { name: "sqlmap".into(), args: Some(vec!["-u".into(), "{url}".into()]) },
                ToolSelection { name: "sslscan".into(), args: None },
            ],
            target: "example.com".into(),
            mode: ExecutionDiscipline::Sequential,
        };
        let resp = execute_tools(&EchoRunner, &cfg, req, &CancelToken::new()).await.unwrap();

        let tools: Vec<ToolKind> = resp.results.iter().map(|r| r.tool).collect();
        assert_eq!(tools, vec![ToolKind::Sqlmap, ToolKind::Sslscan]);
        assert_eq!(resp.results[0].response.output, "-u http://example.com");
        assert_eq!(resp.results[0].response.error.as_deref(), Some("boom"));
        assert_eq!(resp.summary.total_tools, 2);
        assert_eq!(resp.summary.failed_tools, 1);
        assert_eq!(resp.summary.total_execution_time, 6);
    }

    #[test]
    fn multi_tool_mode_defaults_to_parallel() {
        let req: MultiToolRequest =
            serde_json::from_str(r#"{"tools":[{"name":"nmap"}],"target":"10.0.0.1"}"#).unwrap();
        assert_eq!(req.mode, ExecutionDiscipline::Parallel);
    }

    #[test]
    fn response_uses_camel_case() {
        let resp = ToolExecutionResponse::from(&ToolExecutionResult::exited(
            ToolKind::Nmap,
            0,
            "ok".into(),
            String::new(),
            12,
        ));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["executionTime"], 12);
        assert!(json.get("error").is_none());
    }
}
