//! External test-runner invocation.
//!
//! Each invocation spawns exactly one process in `qa.project_root`:
//! either the AI test runner (when one is found on disk) or the plain
//! coverage command. Results are reported as data; a failing test suite is
//! a successful invocation with a non-zero `returncode`.
//!
//! | Mode | Command |
//! |------|---------|
//! | `ai` | AI runner if found, otherwise the plain command |
//! | `pytest` | always the plain command |
//! | `auto` | same as `ai` |
//!
//! Runner discovery walks `qa.ai_runner_candidates` in order. A runner under
//! `tools/` runs as a module (`python -m tools.ai_test_runner`), anything
//! else as a script (`python ai_test_runner.py`).

use anyhow::{Context, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::QaConfig;
use crate::coverage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    #[default]
    Auto,
    Ai,
    Pytest,
}

impl TestMode {
    /// Apply the `with_ai` body override, which only affects `auto`.
    pub fn with_override(self, with_ai: Option<bool>) -> Self {
        match (self, with_ai) {
            (TestMode::Auto, Some(true)) => TestMode::Ai,
            (TestMode::Auto, Some(false)) => TestMode::Pytest,
            (mode, _) => mode,
        }
    }
}

impl std::str::FromStr for TestMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(TestMode::Auto),
            "ai" => Ok(TestMode::Ai),
            "pytest" => Ok(TestMode::Pytest),
            other => anyhow::bail!("unknown test mode '{}': expected auto, ai or pytest", other),
        }
    }
}

/// A located AI test runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiRunner {
    /// Path relative to the project root (or absolute, as configured).
    pub path: PathBuf,
    /// Dotted module name when the runner lives under `tools/`.
    pub module: Option<String>,
}

/// Fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub uses_ai: bool,
}

impl ResolvedCommand {
    /// Shell-like rendering for logs and reports.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{}'", part.replace('\'', r"'\''"))
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Buffered run result returned by `POST /qa/run-tests`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: TestMode,
    pub command: String,
    /// Exit code; `None` when the process was killed by a signal or timed out.
    pub returncode: Option<i32>,
    pub timed_out: bool,
    /// Stdout followed by stderr.
    pub output: String,
    pub coverage: Option<f64>,
    pub coverage_html_available: bool,
    pub ai_runner_present: bool,
}

pub fn discover_ai_runner(config: &QaConfig) -> Option<AiRunner> {
    config
        .ai_runner_candidates
        .iter()
        .find(|candidate| config.resolve(candidate).is_file())
        .map(|candidate| AiRunner {
            path: candidate.clone(),
            module: module_name(candidate),
        })
}

/// `tools/ai_test_runner.py` → `tools.ai_test_runner`; `None` outside `tools/`.
fn module_name(path: &Path) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.with_extension("").components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.len() >= 2 && parts[0] == "tools" {
        Some(parts.join("."))
    } else {
        None
    }
}

fn plain_command(config: &QaConfig) -> ResolvedCommand {
    let mut parts = config.test_command.iter().cloned();
    ResolvedCommand {
        program: parts.next().unwrap_or_else(|| "pytest".to_string()),
        args: parts.collect(),
        uses_ai: false,
    }
}

fn ai_command(config: &QaConfig, runner: &AiRunner) -> ResolvedCommand {
    let args = match &runner.module {
        Some(module) => vec!["-m".to_string(), module.clone()],
        None => vec![runner.path.to_string_lossy().into_owned()],
    };
    ResolvedCommand {
        program: config.python.clone(),
        args,
        uses_ai: true,
    }
}

/// Pick the command for a mode. Asking for `ai` without a runner on disk
/// silently degrades to the plain command.
pub fn choose_command(mode: TestMode, config: &QaConfig) -> ResolvedCommand {
    match mode {
        TestMode::Pytest => plain_command(config),
        TestMode::Ai | TestMode::Auto => match discover_ai_runner(config) {
            Some(runner) => ai_command(config, &runner),
            None => plain_command(config),
        },
    }
}

fn spawn(command: &ResolvedCommand, config: &QaConfig) -> Result<tokio::process::Child> {
    Command::new(&command.program)
        .args(&command.args)
        .current_dir(&config.project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start test command: {}", command.display()))
}

/// Run to completion and collect everything the process printed.
pub async fn run_buffered(mode: TestMode, config: &QaConfig) -> Result<RunReport> {
    let command = choose_command(mode, config);
    tracing::info!(mode = ?mode, command = %command.display(), "running tests");

    let child = spawn(&command, config)?;
    let wait = child.wait_with_output();

    let (returncode, timed_out, output) = match config.timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
            Ok(out) => {
                let out = out.context("Failed to collect test output")?;
                (out.status.code(), false, combine_output(&out.stdout, &out.stderr))
            }
            // The child is killed when the timed-out future drops it.
            Err(_) => (None, true, format!("test command timed out after {} seconds\n", secs)),
        },
        None => {
            let out = wait.await.context("Failed to collect test output")?;
            (out.status.code(), false, combine_output(&out.stdout, &out.stderr))
        }
    };

    tracing::info!(returncode = ?returncode, timed_out, "test run finished");

    let coverage = coverage::read_coverage_percent(&config.coverage_xml_path());
    Ok(RunReport {
        mode,
        command: command.display(),
        returncode,
        timed_out,
        output,
        coverage,
        coverage_html_available: coverage::html_report_available(config),
        ai_runner_present: discover_ai_runner(config).is_some(),
    })
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut output = String::from_utf8_lossy(stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(stderr));
    output
}

/// Spawn the test command and stream its output as it is produced.
///
/// The process is spawned before this returns, so a missing executable is
/// an error here rather than a truncated stream. After exit a trailer with
/// the exit code and coverage is appended and the HTML report is published.
/// Dropping the stream kills the process.
///
/// The receiver resolves to the exit code once the run ends. It is `None`
/// when the process was killed (timeout, disconnect or signal).
pub fn run_streamed(
    mode: TestMode,
    config: QaConfig,
) -> Result<(
    impl Stream<Item = Result<Vec<u8>, Infallible>> + Send + 'static,
    oneshot::Receiver<Option<i32>>,
)> {
    let command = choose_command(mode, &config);
    tracing::info!(mode = ?mode, command = %command.display(), "streaming tests");

    let mut child = spawn(&command, &config)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let _ = tx
            .send(format!("$ {}\n", command.display()).into_bytes())
            .await;

        let outcome = {
            let pump = async {
                tokio::join!(forward(stdout, tx.clone()), forward(stderr, tx.clone()));
                child.wait().await
            };
            let deadline = async {
                match config.timeout_secs {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                status = pump => StreamOutcome::Exited(status),
                _ = tx.closed() => StreamOutcome::Disconnected,
                _ = deadline => StreamOutcome::TimedOut,
            }
        };

        let exit_code = match &outcome {
            StreamOutcome::Exited(Ok(status)) => status.code(),
            _ => None,
        };

        match outcome {
            StreamOutcome::Exited(Ok(status)) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                tracing::info!(exit = %code, "streamed test run finished");
                let _ = tx.send(format!("\n[exit code: {}]\n", code).into_bytes()).await;

                if let Some(pct) = coverage::read_coverage_percent(&config.coverage_xml_path()) {
                    let _ = tx.send(format!("[coverage: {:.2}%]\n", pct).into_bytes()).await;
                }
                let published = coverage::publish_html(&config);
                if let Some(index) = published.index {
                    let _ = tx.send(format!("[coverage html: {}]\n", index).into_bytes()).await;
                }
            }
            StreamOutcome::Exited(Err(e)) => {
                tracing::error!(error = %e, "failed to wait for test process");
                let _ = tx.send(format!("\n[error: {}]\n", e).into_bytes()).await;
            }
            StreamOutcome::Disconnected => {
                tracing::warn!("client disconnected, killing test process");
                let _ = child.kill().await;
            }
            StreamOutcome::TimedOut => {
                tracing::warn!("streamed test run timed out, killing test process");
                let _ = child.kill().await;
                let secs = config.timeout_secs.unwrap_or_default();
                let _ = tx
                    .send(format!("\n[timed out after {} seconds]\n", secs).into_bytes())
                    .await;
            }
        }
        let _ = exit_tx.send(exit_code);
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    Ok((stream, exit_rx))
}

enum StreamOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Disconnected,
    TimedOut,
}

/// Copy a pipe into the channel until EOF or until the receiver goes away.
async fn forward<R>(reader: Option<R>, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = match reader {
        Some(r) => r,
        None => return,
    };
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading test output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn qa_config(root: &Path) -> QaConfig {
        QaConfig {
            project_root: root.to_path_buf(),
            ..QaConfig::default()
        }
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_mode_parsing_and_override() {
        assert_eq!("AI".parse::<TestMode>().unwrap(), TestMode::Ai);
        assert!("nose".parse::<TestMode>().is_err());
        assert_eq!(TestMode::Auto.with_override(Some(true)), TestMode::Ai);
        assert_eq!(TestMode::Auto.with_override(Some(false)), TestMode::Pytest);
        assert_eq!(TestMode::Pytest.with_override(Some(true)), TestMode::Pytest);
        assert_eq!(TestMode::Ai.with_override(None), TestMode::Ai);
    }

    #[test]
    fn test_module_name() {
        assert_eq!(
            module_name(Path::new("tools/ai_test_runner.py")).as_deref(),
            Some("tools.ai_test_runner")
        );
        assert_eq!(
            module_name(Path::new("./tools/qa/runner.py")).as_deref(),
            Some("tools.qa.runner")
        );
        assert_eq!(module_name(Path::new("ai_test_runner.py")), None);
        assert_eq!(module_name(Path::new("scripts/ai_test_runner.py")), None);
    }

    #[test]
    fn test_choose_command_without_runner() {
        let tmp = TempDir::new().unwrap();
        let config = qa_config(tmp.path());
        for mode in [TestMode::Auto, TestMode::Ai, TestMode::Pytest] {
            let cmd = choose_command(mode, &config);
            assert_eq!(cmd.program, "pytest");
            assert!(!cmd.uses_ai);
        }
        assert_eq!(
            choose_command(TestMode::Pytest, &config).display(),
            "pytest --cov=app --cov-report=xml --cov-report=html"
        );
    }

    #[test]
    fn test_choose_command_with_tools_runner() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("tools")).unwrap();
        std::fs::write(tmp.path().join("tools/ai_test_runner.py"), "").unwrap();
        let config = qa_config(tmp.path());

        let cmd = choose_command(TestMode::Auto, &config);
        assert!(cmd.uses_ai);
        assert_eq!(cmd.display(), "python -m tools.ai_test_runner");
        assert_eq!(choose_command(TestMode::Ai, &config), cmd);
        assert!(!choose_command(TestMode::Pytest, &config).uses_ai);
    }

    #[test]
    fn test_choose_command_with_bare_script() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ai_test_runner.py"), "").unwrap();
        let config = qa_config(tmp.path());
        let runner = discover_ai_runner(&config).unwrap();
        assert_eq!(runner.module, None);
        assert_eq!(
            choose_command(TestMode::Ai, &config).display(),
            "python ai_test_runner.py"
        );
    }

    #[test]
    fn test_display_quotes_arguments() {
        let cmd = ResolvedCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo it's".to_string()],
            uses_ai: false,
        };
        assert_eq!(cmd.display(), r"sh -c 'echo it'\''s'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_buffered_reports_exit_code_and_output() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: shell("echo collected 3 items; echo warning >&2; exit 3"),
            ..qa_config(tmp.path())
        };
        let report = run_buffered(TestMode::Pytest, &config).await.unwrap();
        assert_eq!(report.returncode, Some(3));
        assert!(!report.timed_out);
        assert_eq!(report.output, "collected 3 items\nwarning\n");
        assert_eq!(report.coverage, None);
        assert!(!report.ai_runner_present);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_buffered_picks_up_coverage() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: shell(r#"echo '<coverage line-rate="0.5"></coverage>' > coverage.xml"#),
            ..qa_config(tmp.path())
        };
        let report = run_buffered(TestMode::Auto, &config).await.unwrap();
        assert_eq!(report.returncode, Some(0));
        assert_eq!(report.coverage, Some(50.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_buffered_timeout() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: shell("sleep 10"),
            timeout_secs: Some(1),
            ..qa_config(tmp.path())
        };
        let report = run_buffered(TestMode::Pytest, &config).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.returncode, None);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: vec!["definitely-not-a-real-test-runner-binary".to_string()],
            ..qa_config(tmp.path())
        };
        assert!(run_buffered(TestMode::Pytest, &config).await.is_err());
        assert!(run_streamed(TestMode::Pytest, config).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streamed_emits_output_and_trailer() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: shell("echo first; echo second; exit 1"),
            ..qa_config(tmp.path())
        };
        let (stream, exit) = run_streamed(TestMode::Pytest, config).unwrap();
        let chunks: Vec<Vec<u8>> = stream.map(|c| c.unwrap()).collect().await;
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert!(text.starts_with("$ sh -c"));
        assert!(text.contains("first\nsecond\n"));
        assert!(text.contains("[exit code: 1]"));
        assert_eq!(exit.await.unwrap(), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streamed_timeout_kills_process() {
        let tmp = TempDir::new().unwrap();
        let config = QaConfig {
            test_command: shell("echo started; exec sleep 30"),
            timeout_secs: Some(1),
            ..qa_config(tmp.path())
        };
        let started = std::time::Instant::now();
        let (stream, exit) = run_streamed(TestMode::Pytest, config).unwrap();
        let chunks: Vec<Vec<u8>> = stream.map(|c| c.unwrap()).collect().await;
        let text = String::from_utf8(chunks.concat()).unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(text.contains("started\n"));
        assert!(text.contains("[timed out after 1 seconds]"));
        assert!(!text.contains("[exit code:"));
        assert_eq!(exit.await.unwrap(), None);
    }

    #[cfg(unix)]
    fn process_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_stream_kills_process() {
        let tmp = TempDir::new().unwrap();
        let pidfile = tmp.path().join("child.pid");
        let config = QaConfig {
            test_command: shell("echo $$ > child.pid; exec sleep 30"),
            ..qa_config(tmp.path())
        };
        let (stream, exit) = run_streamed(TestMode::Pytest, config).unwrap();
        let mut stream = Box::pin(stream);
        let header = stream.next().await.unwrap().unwrap();
        assert!(String::from_utf8(header).unwrap().starts_with("$ sh -c"));

        let mut pid = String::new();
        for _ in 0..100 {
            pid = std::fs::read_to_string(&pidfile).unwrap_or_default().trim().to_string();
            if !pid.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!pid.is_empty(), "test process never wrote its pid");
        assert!(process_alive(&pid));

        drop(stream);
        assert_eq!(exit.await.unwrap(), None);
        assert!(!process_alive(&pid), "process {} survived the disconnect", pid);
    }
}
