//! Process supervisor that runs container commands as host processes.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use berth_common::error::{BerthError, Result};
use futures::FutureExt;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{ProcessSpec, ProcessStdio, ProcessSupervisor, SpawnedProcess};

/// Spawns container processes with tokio and signals them with `nix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSupervisor;

impl HostSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Exit code of a reaped process; `128 + signal` when it was killed.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[async_trait]
impl ProcessSupervisor for HostSupervisor {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess> {
        let mut command = tokio::process::Command::new(&spec.path);
        let _ = command
            .args(&spec.args)
            .envs(spec.env.iter().filter_map(|pair| pair.split_once('=')))
            .current_dir(&spec.working_dir)
            .stdin(if spec.open_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| BerthError::process(format!("failed to start {}: {e}", spec.path)))?;
        let pid = child
            .id()
            .ok_or_else(|| BerthError::process("process exited before its pid was known"))?;

        let stdio = ProcessStdio {
            stdin: child
                .stdin
                .take()
                .map(|pipe| Box::new(pipe) as crate::stdio::StdinWriter),
            stdout: child
                .stdout
                .take()
                .map(|pipe| Box::new(pipe) as crate::stdio::OutputReader),
            stderr: child
                .stderr
                .take()
                .map(|pipe| Box::new(pipe) as crate::stdio::OutputReader),
        };

        let container = spec.container.clone();
        let exit = async move {
            match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(id = %container, pid, error = %e, "failed to reap container process");
                    -1
                }
            }
        }
        .boxed();

        tracing::debug!(id = %spec.container, pid, path = %spec.path, "process spawned");
        Ok(SpawnedProcess { pid, stdio, exit })
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| BerthError::process(format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), signal)
            .map_err(|e| BerthError::process(format!("failed to send {signal} to {pid}: {e}")))
    }

    async fn processes(&self, pid: u32) -> Result<Vec<u32>> {
        tokio::task::spawn_blocking(move || descendants(Path::new("/proc"), pid))
            .await
            .map_err(|e| BerthError::process(format!("process scan failed: {e}")))?
    }
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
fn parent_pid(stat: &str) -> Option<u32> {
    // The command name is parenthesised and may itself contain spaces.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// `root` and every process below it, read from a procfs mount.
fn descendants(proc_root: &Path, root: u32) -> Result<Vec<u32>> {
    let entries = std::fs::read_dir(proc_root).map_err(|e| BerthError::io(proc_root, e))?;
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        // Processes may vanish between listing and reading.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parent_pid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = vec![root];
    let mut cursor = 0;
    while let Some(&pid) = found.get(cursor) {
        if let Some(kids) = children.get(&pid) {
            found.extend(kids.iter().copied());
        }
        cursor += 1;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_common::types::ContainerId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn spec(path: &str, args: &[&str], open_stdin: bool, dir: &Path) -> ProcessSpec {
        ProcessSpec {
            container: ContainerId::new("test"),
            path: path.into(),
            args: args.iter().map(ToString::to_string).collect(),
            env: vec!["BERTH_TEST=1".into()],
            working_dir: dir.to_path_buf(),
            open_stdin,
        }
    }

    #[test]
    fn parent_pid_skips_command_with_spaces() {
        assert_eq!(parent_pid("42 (my proc) S 7 42 42 0"), Some(7));
        assert_eq!(parent_pid("garbage"), None);
    }

    #[test]
    fn descendants_walks_fake_procfs() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (pid, ppid) in [(10, 1), (11, 10), (12, 11), (13, 1)] {
            let path = dir.path().join(pid.to_string());
            std::fs::create_dir(&path).expect("mkdir");
            std::fs::write(path.join("stat"), format!("{pid} (sh) S {ppid} 0 0")).expect("stat");
        }
        std::fs::create_dir(dir.path().join("self")).expect("mkdir");

        let mut pids = descendants(dir.path(), 10).expect("scan");
        pids.sort_unstable();
        assert_eq!(pids, [10, 11, 12]);
    }

    #[tokio::test]
    async fn spawn_pipes_stdio_and_reports_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let supervisor = HostSupervisor::new();
        let mut child = supervisor
            .spawn(&spec("/bin/sh", &["-c", "cat; echo \"$BERTH_TEST\" >&2; exit 3"], true, dir.path()))
            .await
            .expect("spawn");
        assert!(child.pid > 0);

        let mut stdin = child.stdio.stdin.take().expect("stdin");
        stdin.write_all(b"hi").await.expect("write");
        drop(stdin);

        let mut out = String::new();
        let _ = child
            .stdio
            .stdout
            .take()
            .expect("stdout")
            .read_to_string(&mut out)
            .await
            .expect("read");
        let mut err = String::new();
        let _ = child
            .stdio
            .stderr
            .take()
            .expect("stderr")
            .read_to_string(&mut err)
            .await
            .expect("read");
        assert_eq!(out, "hi");
        assert_eq!(err.trim(), "1");
        assert_eq!(child.exit.await, 3);
    }

    #[tokio::test]
    async fn killed_process_exits_with_128_plus_signal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let supervisor = HostSupervisor::new();
        let child = supervisor
            .spawn(&spec("/bin/sleep", &["30"], false, dir.path()))
            .await
            .expect("spawn");
        let pids = supervisor.processes(child.pid).await.expect("processes");
        assert_eq!(pids.first(), Some(&child.pid));

        supervisor.signal(child.pid, Signal::SIGKILL).expect("kill");
        assert_eq!(child.exit.await, 137);
    }

    #[tokio::test]
    async fn spawn_of_missing_binary_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = HostSupervisor::new()
            .spawn(&spec("/nonexistent/binary", &[], false, dir.path()))
            .await
            .expect_err("missing binary");
        assert!(matches!(err, BerthError::Process { .. }));
    }
}
