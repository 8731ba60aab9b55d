//! Task Runner: launches one job's containerized work and waits for it.
//!
//! A run either succeeds or yields a [`TaskFailure`]; non-zero exits,
//! timeouts and launch errors are all failures, never `Err`s of the engine.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use jobchain_core::config::{RunnerConfig, RunnerKind};
use jobchain_core::{JobDefinition, TaskSpec};
use tokio::process::Command;

/// Value of `JOB_TYPE` handed to every task.
pub const JOB_TYPE: &str = "RUNTASK";

/// Bytes of stderr kept in the log when a task fails.
const STDERR_TAIL: usize = 2000;

/// Why a task did not succeed. `detail` is what lands in the Status Store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub detail: String,
}

impl TaskFailure {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    pub fn exit_code(code: i32) -> Self {
        Self::new(format!("exit code {code}"))
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(format!("timed out after {}s", after.as_secs()))
    }

    pub fn launch(e: impl std::fmt::Display) -> Self {
        Self::new(format!("launch error: {e}"))
    }

    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::exit_code(code),
            None => Self::new("terminated by signal"),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

pub type TaskResult = std::result::Result<(), TaskFailure>;

/// Everything a runner needs for one attempt.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub job_id: String,
    pub invocation_date: NaiveDate,
    pub spec: TaskSpec,
    pub timeout: Duration,
}

impl TaskRequest {
    pub fn new(job: &JobDefinition, invocation_date: NaiveDate) -> Self {
        Self {
            job_id: job.id.clone(),
            invocation_date,
            spec: job.task.clone(),
            timeout: job.timeout(),
        }
    }

    /// Task environment, resolving secrets from the host environment.
    pub fn environment(&self) -> std::result::Result<Vec<(String, String)>, TaskFailure> {
        self.environment_with(|name| std::env::var(name).ok())
    }

    /// Fixed variables first, then the job's literals, then its secrets.
    pub fn environment_with<F>(&self, lookup: F) -> std::result::Result<Vec<(String, String)>, TaskFailure>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = vec![
            ("JOB_ID".to_string(), self.job_id.clone()),
            ("JOB_TYPE".to_string(), JOB_TYPE.to_string()),
            ("INVOKE_DATE".to_string(), self.invocation_date.to_string()),
        ];
        env.extend(
            self.spec
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        for (name, source) in &self.spec.secrets {
            let value = lookup(source).ok_or_else(|| {
                TaskFailure::launch(format!("secret {name}: host variable {source} is not set"))
            })?;
            env.push((name.clone(), value));
        }
        Ok(env)
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Exactly one attempt, bounded by `request.timeout`.
    async fn run(&self, request: &TaskRequest) -> TaskResult;
}

/// Runs the task image through a docker-compatible CLI.
pub struct ContainerRunner {
    binary: String,
}

impl ContainerRunner {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// CLI arguments for `request`. Variables are passed by name only so
    /// secret values never show up in the process list.
    pub fn args(&self, request: &TaskRequest, env: &[(String, String)], container: &str) -> Vec<String> {
        let spec = &request.spec;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            "--cpus".to_string(),
            format!("{:.2}", spec.cpu as f64 / 1024.0),
            "--memory".to_string(),
            format!("{}m", spec.memory_mib),
            "--read-only".to_string(),
        ];
        for (name, _) in env {
            args.push("-e".to_string());
            args.push(name.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

async fn kill_container(binary: &str, container: &str) {
    let result = Command::new(binary)
        .args(["kill", container])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!("⚠️ Failed to kill container {container}: {e}");
    }
}

/// Kills the named container if the run is abandoned before the container
/// exits. Dropping the CLI client alone leaves the container running.
struct ContainerGuard {
    binary: String,
    container: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(binary: &str, container: &str) -> Self {
        Self {
            binary: binary.to_string(),
            container: container.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️ No runtime to kill abandoned container {}", self.container);
            return;
        };
        tracing::warn!("🛑 Run abandoned, killing container {}", self.container);
        let binary = std::mem::take(&mut self.binary);
        let container = std::mem::take(&mut self.container);
        handle.spawn(async move { kill_container(&binary, &container).await });
    }
}

#[async_trait]
impl TaskRunner for ContainerRunner {
    fn name(&self) -> &str {
        "container"
    }

    async fn run(&self, request: &TaskRequest) -> TaskResult {
        let env = request.environment()?;
        let container = format!(
            "jobchain-{}-{}",
            request.job_id.to_lowercase(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(request, &env, &container));
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        tracing::info!("🐳 Starting {} for {} ({})", request.spec.image, request.job_id, container);
        let mut guard = ContainerGuard::new(&self.binary, &container);
        let result = wait_bounded(cmd, request.timeout).await;
        guard.disarm();
        match result {
            Some(result) => result,
            None => {
                kill_container(&self.binary, &container).await;
                Err(TaskFailure::timed_out(request.timeout))
            }
        }
    }
}

/// Runs the job's `command` directly on the host. For development setups
/// without a container engine.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, request: &TaskRequest) -> TaskResult {
        let (program, args) = request
            .spec
            .command
            .split_first()
            .ok_or_else(|| TaskFailure::launch("no command configured"))?;
        let env = request.environment()?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        tracing::info!("▶️ Starting '{}' for {}", request.spec.command.join(" "), request.job_id);
        wait_bounded(cmd, request.timeout)
            .await
            .unwrap_or_else(|| Err(TaskFailure::timed_out(request.timeout)))
    }
}

/// Spawn `cmd` and wait at most `timeout`. `None` means the deadline passed;
/// the child has been killed by then.
async fn wait_bounded(mut cmd: Command, timeout: Duration) -> Option<TaskResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Some(Err(TaskFailure::launch(e))),
    };
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Some(Err(TaskFailure::launch(e))),
        Err(_) => return None,
    };
    if output.status.success() {
        return Some(Ok(()));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    let tail = stderr.get(start..).unwrap_or(stderr.as_ref());
    tracing::warn!("Task stderr:\n{}", tail.trim_end());
    Some(Err(TaskFailure::from_status(output.status)))
}

pub fn runner_from_config(config: &RunnerConfig) -> Arc<dyn TaskRunner> {
    match config.kind {
        RunnerKind::Container => Arc::new(ContainerRunner::new(&config.binary)),
        RunnerKind::Process => Arc::new(ProcessRunner::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &[&str]) -> TaskRequest {
        let mut spec = TaskSpec::image("registry.example.com/batch:latest");
        spec.command = command.iter().map(|s| s.to_string()).collect();
        spec.environment.insert("BUCKET_NAME".into(), "results".into());
        let job = JobDefinition::new("Job0001", spec).with_timeout(Duration::from_secs(5));
        TaskRequest::new(&job, NaiveDate::from_ymd_opt(2024, 5, 6).unwrap())
    }

    #[test]
    fn test_environment_order() {
        let req = request(&[]);
        let env = req.environment_with(|_| None).unwrap();
        let names: Vec<_> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, ["JOB_ID", "JOB_TYPE", "INVOKE_DATE", "BUCKET_NAME"]);
        assert_eq!(env[2].1, "2024-05-06");
        assert_eq!(env[1].1, "RUNTASK");
    }

    #[test]
    fn test_missing_secret_is_launch_failure() {
        let mut req = request(&[]);
        req.spec.secrets.insert("DB_PASSWORD".into(), "BATCH_DB_PASSWORD".into());

        let err = req.environment_with(|_| None).unwrap_err();
        assert!(err.detail.starts_with("launch error"));

        let env = req
            .environment_with(|name| (name == "BATCH_DB_PASSWORD").then(|| "s3cret".to_string()))
            .unwrap();
        assert!(env.contains(&("DB_PASSWORD".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn test_container_args() {
        let mut req = request(&["python", "batch.py"]);
        req.spec.secrets.insert("DB_PASSWORD".into(), "SRC".into());
        let env = req.environment_with(|_| Some("hidden".into())).unwrap();
        let args = ContainerRunner::new("docker").args(&req, &env, "jobchain-job0001-abc");

        assert_eq!(&args[..4], ["run", "--rm", "--name", "jobchain-job0001-abc"]);
        assert!(args.windows(2).any(|w| w == ["--cpus", "0.25"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "512m"]));
        assert!(args.windows(2).any(|w| w == ["-e", "DB_PASSWORD"]));
        assert!(!args.iter().any(|a| a.contains("hidden")));
        assert_eq!(
            &args[args.len() - 3..],
            ["registry.example.com/batch:latest", "python", "batch.py"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_exit_code() {
        let runner = ProcessRunner::new();
        assert_eq!(runner.run(&request(&["sh", "-c", "exit 0"])).await, Ok(()));
        assert_eq!(
            runner.run(&request(&["sh", "-c", "exit 137"])).await,
            Err(TaskFailure::exit_code(137))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_sees_environment() {
        let runner = ProcessRunner::new();
        let req = request(&["sh", "-c", "test \"$JOB_ID\" = Job0001 && test \"$BUCKET_NAME\" = results"]);
        assert_eq!(runner.run(&req).await, Ok(()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout() {
        let mut req = request(&["sleep", "30"]);
        req.timeout = Duration::from_millis(200);
        let result = ProcessRunner::new().run(&req).await;
        assert_eq!(result, Err(TaskFailure::timed_out(req.timeout)));
    }

    /// Stand-in container CLI: `run` blocks, `kill` appends its arguments
    /// to a log next to the script.
    #[cfg(unix)]
    fn fake_engine(tag: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("jobchain-engine-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = dir.join("kills.log");
        let script = dir.join("engine");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = kill ]; then echo \"$2\" >> {}; exit 0; fi\nexec sleep 30\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    async fn wait_for_kill(log: &std::path::Path) -> String {
        for _ in 0..100 {
            if let Ok(content) = std::fs::read_to_string(log) {
                if !content.is_empty() {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("container was never killed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_killed_on_timeout() {
        let (script, log) = fake_engine("timeout");
        let mut req = request(&[]);
        req.timeout = Duration::from_millis(200);

        let result = ContainerRunner::new(script.to_str().unwrap()).run(&req).await;

        assert_eq!(result, Err(TaskFailure::timed_out(req.timeout)));
        assert!(wait_for_kill(&log).await.starts_with("jobchain-job0001-"));
        let _ = std::fs::remove_dir_all(script.parent().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_killed_when_run_is_dropped() {
        let (script, log) = fake_engine("dropped");
        let runner = ContainerRunner::new(script.to_str().unwrap());
        let req = request(&[]);

        // The caller gives up long before the runner's own 5s timeout.
        let abandoned = tokio::time::timeout(Duration::from_millis(200), runner.run(&req)).await;

        assert!(abandoned.is_err());
        assert!(wait_for_kill(&log).await.starts_with("jobchain-job0001-"));
        let _ = std::fs::remove_dir_all(script.parent().unwrap());
    }

    #[tokio::test]
    async fn test_launch_error() {
        let req = request(&["/nonexistent/jobchain-binary"]);
        let err = ProcessRunner::new().run(&req).await.unwrap_err();
        assert!(err.detail.starts_with("launch error"));
    }
}
