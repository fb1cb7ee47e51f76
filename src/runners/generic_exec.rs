//! Executes a command string via a subshell, tokenizing stdout/stderr into
//! `log` events per line; exit code >= 1 is a failure.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{channel, EventStream, LogLevel, Result, Runner, RunnerEvent};

#[derive(Debug, Clone, Default)]
pub struct GenericExecConfig {
    pub case_name: String,
}

/// Runner id `"subprocess-exec"`. `file` is interpreted as the command
/// string to execute, tokenized with shell-word rules.
pub struct GenericExecRunner {
    config: GenericExecConfig,
}

impl GenericExecRunner {
    pub fn new(config: GenericExecConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Runner for GenericExecRunner {
    fn id(&self) -> &str {
        "subprocess-exec"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn run(&self, suite_id: String, file: String) -> Result<EventStream> {
        let (tx, rx) = channel(64);
        let case_name = if self.config.case_name.is_empty() {
            file.clone()
        } else {
            self.config.case_name.clone()
        };

        tokio::spawn(async move {
            let suite_start = Instant::now();
            let _ = tx.send(RunnerEvent::SuiteStart { suite_id: suite_id.clone() }).await;
            let _ = tx
                .send(RunnerEvent::CaseStart {
                    suite_id: suite_id.clone(),
                    case_name: case_name.clone(),
                })
                .await;

            let case_start = Instant::now();
            let tokens = shell_words::split(&file).unwrap_or_else(|_| vec![file.clone()]);
            let Some((program, args)) = tokens.split_first() else {
                let _ = tx
                    .send(RunnerEvent::CaseFail {
                        suite_id: suite_id.clone(),
                        case_name: case_name.clone(),
                        error: "empty command".to_string(),
                        duration: case_start.elapsed(),
                    })
                    .await;
                let _ = tx
                    .send(RunnerEvent::SuiteEnd {
                        suite_id,
                        passed: 0,
                        failed: 1,
                        skipped: 0,
                        duration: suite_start.elapsed(),
                    })
                    .await;
                return;
            };

            let mut child = match Command::new(program)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    let _ = tx
                        .send(RunnerEvent::CaseFail {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                            error: format!("failed to spawn: {}", e),
                            duration: case_start.elapsed(),
                        })
                        .await;
                    let _ = tx
                        .send(RunnerEvent::SuiteEnd {
                            suite_id,
                            passed: 0,
                            failed: 1,
                            skipped: 0,
                            duration: suite_start.elapsed(),
                        })
                        .await;
                    return;
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            if let Some(stdout) = stdout {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx
                            .send(RunnerEvent::Log {
                                level: LogLevel::Info,
                                message: line,
                            })
                            .await;
                    }
                });
            }

            let mut stderr_lines = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = tx
                        .send(RunnerEvent::Log {
                            level: LogLevel::Warn,
                            message: line.clone(),
                        })
                        .await;
                    stderr_lines.push(line);
                }
            }

            let status = child.wait().await;
            let (passed, failed) = match status {
                Ok(status) if status.success() => {
                    let _ = tx
                        .send(RunnerEvent::CasePass {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                            duration: case_start.elapsed(),
                        })
                        .await;
                    (1, 0)
                }
                Ok(status) => {
                    let error = if stderr_lines.is_empty() {
                        format!("exit code {}", status.code().unwrap_or(-1))
                    } else {
                        stderr_lines.join("\n")
                    };
                    let _ = tx
                        .send(RunnerEvent::CaseFail {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                            error,
                            duration: case_start.elapsed(),
                        })
                        .await;
                    (0, 1)
                }
                Err(e) => {
                    let _ = tx
                        .send(RunnerEvent::CaseFail {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                            error: e.to_string(),
                            duration: case_start.elapsed(),
                        })
                        .await;
                    (0, 1)
                }
            };

            let _ = tx
                .send(RunnerEvent::SuiteEnd {
                    suite_id,
                    passed,
                    failed,
                    skipped: 0,
                    duration: suite_start.elapsed(),
                })
                .await;
        });

        Ok(rx)
    }
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
    async fn stdout_lines_become_log_events() {
        let runner = GenericExecRunner::new(GenericExecConfig::default());
        let events = collect(
            runner
                .run("s1".into(), "printf 'a\\nb\\n'".into())
                .await
                .unwrap(),
        )
        .await;
        let log_count = events.iter().filter(|e| matches!(e, RunnerEvent::Log { .. })).count();
        assert_eq!(log_count, 2);
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CasePass { .. })));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_case() {
        let runner = GenericExecRunner::new(GenericExecConfig::default());
        let events = collect(runner.run("s1".into(), "false".into()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CaseFail { .. })));
    }
}
