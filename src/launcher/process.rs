//! Counting live processes in a process group.

use std::sync::Arc;

use async_trait::async_trait;

use super::command::{CommandRunner, Invocation};
use crate::error::{JobError, JobResult};

/// Lists processes by process-group id.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Number of live (non-zombie) processes in group `pgid`.
    async fn count_group(&self, pgid: i32) -> JobResult<usize>;
}

/// Reads `/proc/<pid>/stat` directly.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone)]
pub struct ProcfsTable;

#[cfg(target_os = "linux")]
#[async_trait]
impl ProcessTable for ProcfsTable {
    async fn count_group(&self, pgid: i32) -> JobResult<usize> {
        let mut entries = tokio::fs::read_dir("/proc")
            .await
            .map_err(|e| JobError::PollTransient(format!("cannot list /proc: {e}")))?;

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| JobError::PollTransient(format!("cannot list /proc: {e}")))?
        {
            let name = entry.file_name();
            if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            // Processes can exit between listing and reading.
            let Ok(stat) = tokio::fs::read_to_string(entry.path().join("stat")).await else {
                continue;
            };
            if let Some((state, group)) = parse_stat(&stat) {
                if group == pgid && !matches!(state, 'Z' | 'X') {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

/// State and process-group id from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesized and may itself contain spaces or
/// parentheses, so fields are read after the last `)`.
pub(crate) fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Asks `pgrep -g`, for systems without procfs.
pub struct PgrepTable {
    runner: Arc<dyn CommandRunner>,
}

impl PgrepTable {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ProcessTable for PgrepTable {
    async fn count_group(&self, pgid: i32) -> JobResult<usize> {
        let output = self
            .runner
            .run(&Invocation::new("pgrep").arg("-g").arg(pgid.to_string()))
            .await
            .map_err(|e| JobError::PollTransient(e.to_string()))?;
        // pgrep exits 1 with no output when nothing matches.
        Ok(output.stdout.lines().filter(|l| !l.trim().is_empty()).count())
    }
}

/// Procfs on Linux, `pgrep` elsewhere.
#[allow(unused_variables)]
pub fn default_process_table(runner: Arc<dyn CommandRunner>) -> Arc<dyn ProcessTable> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsTable)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(PgrepTable::new(runner))
    }
}
