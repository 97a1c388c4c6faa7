//! Process listing of a running container via `ps`.

use std::collections::HashSet;

use berth_common::error::{BerthError, Result};
use serde::Serialize;

/// Arguments used when the client passes none.
pub const DEFAULT_PS_ARGS: &str = "-ef";

/// `ps` output restricted to one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopResult {
    /// Column headers.
    pub titles: Vec<String>,
    /// One row per process, aligned with `titles`.
    pub processes: Vec<Vec<String>>,
}

/// Keeps the rows of `ps` output whose PID belongs to `pids`.
///
/// The last column keeps its embedded spaces so commands survive intact.
///
/// # Errors
///
/// Returns an error if the output has no `PID` column.
pub fn filter_ps_output(output: &str, pids: &[u32]) -> Result<TopResult> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let titles: Vec<String> = lines
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let pid_column = titles
        .iter()
        .position(|title| title == "PID")
        .ok_or_else(|| BerthError::process("couldn't find PID field in ps output"))?;

    let wanted: HashSet<u32> = pids.iter().copied().collect();
    let fixed = titles.len().saturating_sub(1);
    let mut processes = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pid) = fields.get(pid_column).and_then(|pid| pid.parse::<u32>().ok()) else {
            continue;
        };
        if !wanted.contains(&pid) || fields.len() < titles.len() {
            continue;
        }
        let mut row: Vec<String> = fields[..fixed].iter().map(|f| (*f).to_string()).collect();
        row.push(fields[fixed..].join(" "));
        processes.push(row);
    }
    Ok(TopResult { titles, processes })
}

/// Runs `ps` with `ps_args` and filters it down to `pids`.
///
/// # Errors
///
/// Returns an error if `ps` cannot be run, exits unsuccessfully, or prints no
/// `PID` column.
pub async fn top(ps_args: &str, pids: &[u32]) -> Result<TopResult> {
    let args: Vec<&str> = if ps_args.trim().is_empty() {
        vec![DEFAULT_PS_ARGS]
    } else {
        ps_args.split_whitespace().collect()
    };
    let output = tokio::process::Command::new("ps")
        .args(&args)
        .output()
        .await
        .map_err(|e| BerthError::process(format!("failed to run ps: {e}")))?;
    if !output.status.success() {
        return Err(BerthError::process(format!(
            "ps {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    filter_ps_output(&String::from_utf8_lossy(&output.stdout), pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
UID        PID  PPID  C STIME TTY          TIME CMD
root         1     0  0 10:00 ?        00:00:01 /sbin/init splash
root       420     1  0 10:01 ?        00:00:00 /bin/sh -c sleep 100
root       421   420  0 10:01 ?        00:00:00 sleep 100
root       999     1  0 10:02 ?        00:00:00 other
";

    #[test]
    fn keeps_only_container_rows_with_full_command() {
        let result = filter_ps_output(SAMPLE, &[420, 421]).expect("filter");
        assert_eq!(result.titles.len(), 8);
        assert_eq!(result.processes.len(), 2);
        assert_eq!(result.processes[0][1], "420");
        assert_eq!(result.processes[0][7], "/bin/sh -c sleep 100");
        assert_eq!(result.processes[1][7], "sleep 100");
    }

    #[test]
    fn missing_pid_column_is_an_error() {
        assert!(filter_ps_output("USER COMMAND\nroot init\n", &[1]).is_err());
        assert!(filter_ps_output("", &[1]).is_err());
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_value(filter_ps_output(SAMPLE, &[999]).expect("filter")).expect("encode");
        assert_eq!(json["Titles"][1], "PID");
        assert_eq!(json["Processes"][0][7], "other");
    }

    #[tokio::test]
    async fn top_lists_own_process() {
        let me = std::process::id();
        let result = top("", &[me]).await.expect("top");
        assert_eq!(result.processes.len(), 1);
    }
}
