//! Sandboxed script execution.
//!
//! Runs the assembled script in a separate interpreter process with a hard
//! wall-clock timeout and a hard cap on captured output. Output past the cap
//! is drained but not kept, so a flooding child can neither exhaust memory
//! nor deadlock on a full pipe. Partial stdout survives every failure mode,
//! including a kill whose orphans still hold the pipe open.

use std::{
    path::Path,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::{ErrorKind, PipelineError},
    script::{AssembledScript, IMAGE_SENTINEL},
    workspace::Workspace,
};

/// How long to keep draining output pipes after the child has exited or been
/// killed. Bounds the wait on grandchildren that inherited the pipe.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub python_bin: String,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl SandboxPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            python_bin: cfg.python_bin(),
            timeout: cfg.execution_timeout(),
            max_output_bytes: cfg.max_output_bytes(),
        }
    }
}

/// Terminal value of one execution. Immutable once produced; the artifact is
/// carried as bytes, its on-disk file is already gone.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub artifact: Option<Vec<u8>>,
    pub error: Option<ErrorKind>,
    pub truncated: bool,
}

#[derive(Default)]
struct CaptureBuf {
    bytes: Vec<u8>,
    truncated: bool,
}

type Capture = Arc<Mutex<CaptureBuf>>;

/// Write the script into the workspace and run it. `Err` means the sandbox
/// itself could not be set up; script-level failures come back inside the
/// `ExecutionResult`.
pub async fn execute(
    script: &AssembledScript,
    workspace: &Workspace,
    policy: &SandboxPolicy,
) -> Result<ExecutionResult, PipelineError> {
    let script_path = workspace.script_path();
    tokio::fs::write(&script_path, script.render())
        .await
        .map_err(|e| PipelineError::Resource(format!("cannot write {}: {}", script_path.display(), e)))?;

    let mut child = Command::new(&policy.python_bin)
        .arg(&script_path)
        .current_dir(workspace.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::Execution(format!("cannot start {}: {}", policy.python_bin, e)))?;

    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::Execution("no stdout pipe".into()))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| PipelineError::Execution("no stderr pipe".into()))?;

    let stdout_buf: Capture = Arc::default();
    let stderr_buf: Capture = Arc::default();
    let cap = policy.max_output_bytes;
    let stdout_task = tokio::spawn(drain_into(stdout_pipe, cap, Arc::clone(&stdout_buf)));
    let stderr_task = tokio::spawn(drain_into(stderr_pipe, cap, Arc::clone(&stderr_buf)));

    // Readers keep draining while we wait, so whatever the child printed
    // before a kill is preserved.
    let status = match timeout(policy.timeout, child.wait()).await {
        Ok(status) => Some(
            status.map_err(|e| PipelineError::Execution(format!("wait failed: {}", e)))?,
        ),
        Err(_) => {
            warn!(workspace = %workspace.id, timeout = ?policy.timeout, "execution timed out, killing interpreter");
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };

    // Pipes normally reach EOF right after exit; the grace bound covers
    // orphaned grandchildren that kept the write end open.
    if timeout(DRAIN_GRACE, async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    })
    .await
    .is_err()
    {
        debug!(workspace = %workspace.id, "output pipes still open after exit, abandoning drain");
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_buf);
    let (stderr, stderr_truncated) = take_capture(&stderr_buf);
    let truncated = stdout_truncated || stderr_truncated;
    if truncated {
        warn!(workspace = %workspace.id, cap, "captured output truncated");
    }

    let Some(status) = status else {
        return Ok(ExecutionResult {
            stdout,
            stderr,
            artifact: None,
            error: Some(ErrorKind::Timeout),
            truncated,
        });
    };

    let artifact = collect_artifact(&stdout, workspace).await;
    let error = if status.success() {
        None
    } else {
        debug!(workspace = %workspace.id, code = ?status.code(), "interpreter exited nonzero");
        Some(ErrorKind::Execution)
    };

    Ok(ExecutionResult { stdout, stderr, artifact, error, truncated })
}

fn take_capture(buf: &Capture) -> (String, bool) {
    let guard = buf.lock().unwrap_or_else(|e| e.into_inner());
    (String::from_utf8_lossy(&guard.bytes).into_owned(), guard.truncated)
}

/// Path announced by the artifact sentinel, if any. The sentinel must start
/// its line, and the epilogue emits its sentinel strictly after user code, so
/// the last matching line is the epilogue's; earlier ones are user output.
pub fn sentinel_path(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(IMAGE_SENTINEL).map(str::trim))
        .next_back()
}

/// If the epilogue announced an artifact, read its bytes and remove the file.
/// The announced path must be exactly the workspace's artifact path; anything
/// else is ignored (sandboxed output is untrusted).
async fn collect_artifact(stdout: &str, workspace: &Workspace) -> Option<Vec<u8>> {
    let path = Path::new(sentinel_path(stdout)?);
    if path != workspace.artifact_path() {
        warn!(workspace = %workspace.id, path = %path.display(), "artifact sentinel does not name the workspace artifact path, ignoring");
        return None;
    }
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => {
            let _ = tokio::fs::remove_file(path).await;
            Some(bytes)
        }
        Ok(_) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "artifact announced but unreadable");
            None
        }
    }
}

/// Read a stream to EOF into the shared buffer, keeping at most `cap` bytes.
/// Bytes past the cap are consumed and dropped so the child never blocks on
/// a full pipe; the buffer records that truncation happened.
async fn drain_into<R: AsyncRead + Unpin>(mut reader: R, cap: usize, sink: Capture) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut guard = sink.lock().unwrap_or_else(|e| e.into_inner());
                if guard.bytes.len() < cap {
                    let take = n.min(cap - guard.bytes.len());
                    guard.bytes.extend_from_slice(&buf[..take]);
                    if take < n {
                        guard.truncated = true;
                    }
                } else {
                    guard.truncated = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::NO_PLOT_SENTINEL;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in interpreter: a shell script that receives the assembled
    /// script path as $1, like the real interpreter would.
    fn fake_interpreter(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-python");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn empty_script() -> AssembledScript {
        AssembledScript {
            header: String::new(),
            bindings: String::new(),
            body: String::new(),
            epilogue: String::new(),
        }
    }

    fn policy(bin: String, timeout_ms: u64) -> SandboxPolicy {
        SandboxPolicy {
            python_bin: bin,
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn sentinel_path_parsing() {
        assert_eq!(
            sentinel_path("some output\nIMAGE_SAVED:/tmp/ws/output.png\n"),
            Some("/tmp/ws/output.png")
        );
        assert_eq!(sentinel_path(NO_PLOT_SENTINEL), None);
        assert_eq!(sentinel_path(""), None);
        assert_eq!(sentinel_path("note: IMAGE_SAVED:/x"), None);
        // The epilogue prints last; its line wins over earlier user output.
        assert_eq!(
            sentinel_path("IMAGE_SAVED:/ws/decoy.bin\nIMAGE_SAVED:/ws/output.png"),
            Some("/ws/output.png")
        );
    }

    #[tokio::test]
    async fn capped_drain_truncates_and_consumes() {
        let data = vec![b'a'; 100_000];
        let sink: Capture = Arc::default();
        drain_into(&data[..], 1000, Arc::clone(&sink)).await;
        let (text, truncated) = take_capture(&sink);
        assert_eq!(text.len(), 1000);
        assert!(truncated);

        let sink: Capture = Arc::default();
        drain_into(&b"short"[..], 1000, Arc::clone(&sink)).await;
        let (text, truncated) = take_capture(&sink);
        assert_eq!(text, "short");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn successful_run_with_artifact() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let bin = fake_interpreter(
            root.path(),
            "d=$(dirname \"$1\")\nprintf 'not-really-a-png' > \"$d/output.png\"\necho analysis done\necho \"IMAGE_SAVED:$d/output.png\"",
        );
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert_eq!(result.error, None);
        assert!(result.stdout.contains("analysis done"));
        assert_eq!(result.artifact.as_deref(), Some(&b"not-really-a-png"[..]));
        // The artifact file itself is gone; only the bytes survive.
        assert!(!ws.artifact_path().exists());
        ws.release();
    }

    #[tokio::test]
    async fn no_sentinel_means_no_artifact() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let bin = fake_interpreter(root.path(), &format!("echo 'text only'\necho {}", NO_PLOT_SENTINEL));
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert_eq!(result.error, None);
        assert!(result.artifact.is_none());
        ws.release();
    }

    #[tokio::test]
    async fn earlier_user_sentinel_cannot_preempt_the_epilogue() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        // User code prints its own sentinel naming a different workspace file
        // before the epilogue announces the real plot.
        let bin = fake_interpreter(
            root.path(),
            "d=$(dirname \"$1\")\nprintf 'decoy' > \"$d/decoy.bin\"\necho \"IMAGE_SAVED:$d/decoy.bin\"\nprintf 'real-png' > \"$d/output.png\"\necho \"IMAGE_SAVED:$d/output.png\"",
        );
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert_eq!(result.error, None);
        assert_eq!(result.artifact.as_deref(), Some(&b"real-png"[..]));
        ws.release();
    }

    #[tokio::test]
    async fn sentinel_naming_a_foreign_file_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        // Only the exact artifact path is honored, even for files inside the
        // workspace.
        let bin = fake_interpreter(
            root.path(),
            "d=$(dirname \"$1\")\nprintf 'decoy' > \"$d/decoy.bin\"\necho \"IMAGE_SAVED:$d/decoy.bin\"",
        );
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert!(result.artifact.is_none());
        ws.release();
    }

    #[tokio::test]
    async fn sentinel_outside_workspace_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let outside = root.path().join("escape.png");
        std::fs::write(&outside, b"secret").unwrap();
        let bin = fake_interpreter(root.path(), &format!("echo \"IMAGE_SAVED:{}\"", outside.display()));
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert!(result.artifact.is_none());
        assert!(outside.exists());
        ws.release();
    }

    #[tokio::test]
    async fn nonzero_exit_preserves_partial_stdout() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let bin = fake_interpreter(root.path(), "echo partial result\necho 'ERROR:boom' >&2\nexit 1");
        let result = execute(&empty_script(), &ws, &policy(bin, 5000)).await.unwrap();
        assert_eq!(result.error, Some(ErrorKind::Execution));
        assert!(result.stdout.contains("partial result"));
        assert!(result.stderr.contains("ERROR:boom"));
        ws.release();
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_stdout() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let bin = fake_interpreter(root.path(), "echo started\nsleep 30");
        let started = std::time::Instant::now();
        let result = execute(&empty_script(), &ws, &policy(bin, 300)).await.unwrap();
        assert_eq!(result.error, Some(ErrorKind::Timeout));
        assert!(result.stdout.contains("started"));
        assert!(result.artifact.is_none());
        // Bounded by timeout + drain grace, not by the sleeping orphan.
        assert!(started.elapsed() < Duration::from_secs(10));
        ws.release();
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_execution_error() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(root.path()).unwrap();
        let err = execute(
            &empty_script(),
            &ws,
            &policy("/nonexistent/python-binary".into(), 1000),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));
        ws.release();
    }
}
