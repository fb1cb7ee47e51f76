//! Invokes a child test tool configured to emit a JSON reporter document and
//! folds it into the unified event stream. The same shape serves both the
//! `subprocess-json` id (generic framework reporters) and `browser-json`
//! (browser test runners such as Playwright, which also emit a JSON report)
//! -- `runner_id` selects which.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{channel, EventStream, LogLevel, Result, Runner, RunnerEvent};

/// Minimal reporter document shape: a flat list of case outcomes. Real
/// framework reporters (jest --json, pytest-json-report, playwright's
/// json reporter) all reduce to this after adapter-side normalization.
#[derive(Debug, Deserialize)]
pub struct JsonReportCase {
    pub name: String,
    pub status: String, // "passed" | "failed" | "skipped"
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JsonReport {
    pub cases: Vec<JsonReportCase>,
}

#[derive(Debug, Clone)]
pub struct SubprocessJsonConfig {
    pub runner_id: String,
    pub command: Vec<String>,
}

impl Default for SubprocessJsonConfig {
    fn default() -> Self {
        Self {
            runner_id: "subprocess-json".to_string(),
            command: Vec::new(),
        }
    }
}

/// Runner ids `"subprocess-json"` / `"browser-json"`.
pub struct SubprocessJsonRunner {
    config: SubprocessJsonConfig,
}

impl SubprocessJsonRunner {
    pub fn new(config: SubprocessJsonConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Runner for SubprocessJsonRunner {
    fn id(&self) -> &str {
        &self.config.runner_id
    }

    async fn available(&self) -> bool {
        !self.config.command.is_empty()
    }

    async fn run(&self, suite_id: String, file: String) -> Result<EventStream> {
        let (tx, rx) = channel(64);
        let mut command = self.config.command.clone();
        command.push(file);

        tokio::spawn(async move {
            let suite_start = Instant::now();
            let _ = tx.send(RunnerEvent::SuiteStart { suite_id: suite_id.clone() }).await;

            let Some((program, args)) = command.split_first() else {
                let _ = tx
                    .send(RunnerEvent::SuiteEnd {
                        suite_id,
                        passed: 0,
                        failed: 0,
                        skipped: 0,
                        duration: suite_start.elapsed(),
                    })
                    .await;
                return;
            };

            let output = Command::new(program)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await;

            let (passed, failed, skipped) = match output {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    match serde_json::from_str::<JsonReport>(&stdout) {
                        Ok(report) => emit_report(&tx, &suite_id, report).await,
                        Err(parse_err) => {
                            if output.status.success() {
                                // Tool succeeded but emitted no parseable
                                // report: nothing to fold into cases.
                                (0, 0, 0)
                            } else {
                                let _ = tx
                                    .send(RunnerEvent::Log {
                                        level: LogLevel::Error,
                                        message: format!("unparseable report: {}", parse_err),
                                    })
                                    .await;
                                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                                let case_name = "subprocess".to_string();
                                let _ = tx
                                    .send(RunnerEvent::CaseStart {
                                        suite_id: suite_id.clone(),
                                        case_name: case_name.clone(),
                                    })
                                    .await;
                                let _ = tx
                                    .send(RunnerEvent::CaseFail {
                                        suite_id: suite_id.clone(),
                                        case_name,
                                        error: if stderr.is_empty() {
                                            format!("exit code {}", output.status.code().unwrap_or(-1))
                                        } else {
                                            stderr
                                        },
                                        duration: Duration::ZERO,
                                    })
                                    .await;
                                (0, 1, 0)
                            }
                        }
                    }
                }
                Err(e) => {
                    let case_name = "subprocess".to_string();
                    let _ = tx
                        .send(RunnerEvent::CaseStart {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                        })
                        .await;
                    let _ = tx
                        .send(RunnerEvent::CaseFail {
                            suite_id: suite_id.clone(),
                            case_name,
                            error: format!("failed to spawn: {}", e),
                            duration: Duration::ZERO,
                        })
                        .await;
                    (0, 1, 0)
                }
            };

            let _ = tx
                .send(RunnerEvent::SuiteEnd {
                    suite_id,
                    passed,
                    failed,
                    skipped,
                    duration: suite_start.elapsed(),
                })
                .await;
        });

        Ok(rx)
    }
}

async fn emit_report(
    tx: &tokio::sync::mpsc::Sender<RunnerEvent>,
    suite_id: &str,
    report: JsonReport,
) -> (u32, u32, u32) {
    let (mut passed, mut failed, mut skipped) = (0u32, 0u32, 0u32);

    for case in report.cases {
        let _ = tx
            .send(RunnerEvent::CaseStart {
                suite_id: suite_id.to_string(),
                case_name: case.name.clone(),
            })
            .await;

        let duration = Duration::from_millis(case.duration_ms);
        match case.status.as_str() {
            "passed" => {
                passed += 1;
                let _ = tx
                    .send(RunnerEvent::CasePass {
                        suite_id: suite_id.to_string(),
                        case_name: case.name,
                        duration,
                    })
                    .await;
            }
            "skipped" => {
                skipped += 1;
                let _ = tx
                    .send(RunnerEvent::CaseSkip {
                        suite_id: suite_id.to_string(),
                        case_name: case.name,
                        reason: case.skip_reason.unwrap_or_default(),
                    })
                    .await;
            }
            _ => {
                failed += 1;
                let _ = tx
                    .send(RunnerEvent::CaseFail {
                        suite_id: suite_id.to_string(),
                        case_name: case.name,
                        error: case.error.unwrap_or_else(|| "case failed".to_string()),
                        duration,
                    })
                    .await;
            }
        }
    }

    (passed, failed, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn collect(stream: EventStream) -> Vec<RunnerEvent> {
        let mut out = Vec::new();
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn parses_json_report_into_case_events() {
        let report = serde_json::json!({
            "cases": [
                {"name": "a", "status": "passed", "duration_ms": 5},
                {"name": "b", "status": "failed", "error": "boom"},
            ]
        });
        let runner = SubprocessJsonRunner::new(SubprocessJsonConfig {
            runner_id: "subprocess-json".into(),
            command: vec!["printf".into(), "%s".into(), report.to_string()],
        });
        let events = collect(runner.run("s1".into(), "".into()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CasePass { case_name, .. } if case_name == "a")));
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CaseFail { case_name, .. } if case_name == "b")));
    }

    #[tokio::test]
    async fn unparseable_report_with_nonzero_exit_emits_synthetic_failure() {
        let runner = SubprocessJsonRunner::new(SubprocessJsonConfig {
            runner_id: "browser-json".into(),
            command: vec!["sh".into(), "-c".into(), "echo not-json; exit 1".into()],
        });
        let events = collect(runner.run("s1".into(), "".into()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CaseFail { .. })));
    }
}
