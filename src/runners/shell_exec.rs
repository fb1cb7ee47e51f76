//! Executes a script file as a single case; exit code 0 is a pass
//!.

use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use super::{channel, EventStream, Result, Runner, RunnerEvent};

#[derive(Debug, Clone)]
pub struct ShellExecConfig {
    pub case_name: String,
    pub args: Vec<String>,
}

impl Default for ShellExecConfig {
    fn default() -> Self {
        Self {
            case_name: "script".to_string(),
            args: Vec::new(),
        }
    }
}

/// Runner id `"shell-exec"`. Treats `file` as an executable script; exit
/// code 0 is a pass, any other exit code is a failure carrying stderr.
pub struct ShellExecRunner {
    config: ShellExecConfig,
}

impl ShellExecRunner {
    pub fn new(config: ShellExecConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Runner for ShellExecRunner {
    fn id(&self) -> &str {
        "shell-exec"
    }

    async fn available(&self) -> bool {
        true
    }

    async fn run(&self, suite_id: String, file: String) -> Result<EventStream> {
        let (tx, rx) = channel(16);
        let case_name = self.config.case_name.clone();
        let args = self.config.args.clone();

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
            let output = Command::new(&file).args(&args).output().await;

            let (passed, failed) = match output {
                Ok(result) if result.status.success() => {
                    let _ = tx
                        .send(RunnerEvent::CasePass {
                            suite_id: suite_id.clone(),
                            case_name: case_name.clone(),
                            duration: case_start.elapsed(),
                        })
                        .await;
                    (1, 0)
                }
                Ok(result) => {
                    let stderr = String::from_utf8_lossy(&result.stderr).to_string();
                    let error = if stderr.is_empty() {
                        format!("exit code {}", result.status.code().unwrap_or(-1))
                    } else {
                        stderr
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
                            error: format!("failed to spawn script: {}", e),
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
    use std::io::Write;
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
    async fn exit_zero_is_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nexit 0").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let runner = ShellExecRunner::new(ShellExecConfig::default());
        let events = collect(runner.run("s1".into(), path.to_string_lossy().into_owned()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CasePass { .. })));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\necho boom 1>&2\nexit 1").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let runner = ShellExecRunner::new(ShellExecConfig::default());
        let events = collect(runner.run("s1".into(), path.to_string_lossy().into_owned()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(e, RunnerEvent::CaseFail { error, .. } if error.contains("boom"))));
    }
}
