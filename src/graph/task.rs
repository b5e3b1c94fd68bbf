// src/graph/task.rs
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::defs::{ResourceLimits, ToolError};
use crate::graph::runner::{ToolOutput, ToolRunner};
use crate::utils::command::ToolCommand;
use crate::utils::file::ensure_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ReferencePrep,
    RegionExtract,
    Align,
    SortIndex,
    Quantify,
    Visualize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ReferencePrep => "reference_prep",
            Stage::RegionExtract => "region_extract",
            Stage::Align => "align",
            Stage::SortIndex => "sort_index",
            Stage::Quantify => "quantify",
            Stage::Visualize => "visualize",
        };
        write!(f, "{}", name)
    }
}

/// One external-tool invocation bound to concrete files.
#[derive(Debug, Clone)]
pub struct StageTask {
    pub stage: Stage,
    /// `None` for run-wide tasks such as the reference build.
    pub sample: Option<String>,
    pub command: ToolCommand,
}

impl StageTask {
    pub fn new(stage: Stage, sample: Option<&str>, command: ToolCommand) -> Self {
        StageTask {
            stage,
            sample: sample.map(str::to_string),
            command,
        }
    }

    pub fn for_sample(stage: Stage, sample: &str, command: ToolCommand) -> Self {
        StageTask::new(stage, Some(sample), command)
    }

    fn label(&self) -> String {
        match &self.sample {
            Some(sample) => format!("[{}] {}", self.stage, sample),
            None => format!("[{}]", self.stage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub stage: Stage,
    pub sample: Option<String>,
    pub tool: String,
    pub status: TaskStatus,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Append-only record of every task the scheduler ran.
#[derive(Debug, Clone, Default)]
pub struct TaskLedger {
    records: Arc<Mutex<Vec<TaskRecord>>>,
}

impl TaskLedger {
    pub fn record(&self, record: TaskRecord) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(record);
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.records().iter().filter(|r| r.status == status).count()
    }

    /// How many times `tool` ran within `stage`.
    pub fn invocations(&self, stage: Stage, tool: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.stage == stage && r.tool == tool)
            .count()
    }
}

const MIB: u64 = 1_048_576;

/// Runs stage tasks under the global CPU and memory budgets and the per-task time limit.
#[derive(Clone)]
pub struct Scheduler {
    runner: Arc<dyn ToolRunner>,
    cpu_budget: Arc<Semaphore>,
    /// One permit per MiB of `max_memory`.
    memory_budget: Arc<Semaphore>,
    max_cpus: usize,
    max_memory_mib: u32,
    max_time: Duration,
    ledger: TaskLedger,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn ToolRunner>, limits: ResourceLimits) -> Self {
        let max_cpus = limits.max_cpus.max(1);
        let max_memory_mib = (limits.max_memory / MIB)
            .clamp(1, u64::from(u32::MAX).min(Semaphore::MAX_PERMITS as u64)) as u32;
        Scheduler {
            runner,
            cpu_budget: Arc::new(Semaphore::new(max_cpus)),
            memory_budget: Arc::new(Semaphore::new(max_memory_mib as usize)),
            max_cpus,
            max_memory_mib,
            max_time: limits.max_time,
            ledger: TaskLedger::default(),
        }
    }

    /// MiB permits for a command's declared memory, rounded up and capped at the budget.
    fn memory_permits(&self, bytes: u64) -> u32 {
        bytes.div_ceil(MIB).min(u64::from(self.max_memory_mib)) as u32
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Checks declared inputs, waits for CPU permits, runs the tool within `max_time`
    /// and verifies every declared output exists.
    pub async fn execute(&self, task: StageTask) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let result = self.execute_inner(&task).await;
        self.record(&task, &task.command.tool, started, result.as_ref().err());
        result
    }

    async fn execute_inner(&self, task: &StageTask) -> Result<ToolOutput, ToolError> {
        let command = &task.command;
        let tool = command.tool.clone();

        if let Some(missing) = command.inputs.iter().find(|p| !p.exists()) {
            return Err(ToolError::MissingInput {
                tool,
                path: missing.clone(),
            });
        }
        for output in &command.outputs {
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                ensure_dir(parent).map_err(|e| ToolError::Io {
                    tool: tool.clone(),
                    error: format!("cannot create {}: {}", parent.display(), e),
                })?;
            }
        }

        let memory_permits = self.memory_permits(command.memory);
        let _memory = if memory_permits > 0 {
            Some(self.memory_budget.acquire_many(memory_permits).await.map_err(|e| ToolError::Io {
                tool: tool.clone(),
                error: format!("memory budget unavailable: {}", e),
            })?)
        } else {
            None
        };

        let permits = command.cpus.min(self.max_cpus).max(1) as u32;
        let _permit = self
            .cpu_budget
            .acquire_many(permits)
            .await
            .map_err(|e| ToolError::Io {
                tool: tool.clone(),
                error: format!("CPU budget unavailable: {}", e),
            })?;

        info!(
            "{} running {} ({} cpus, {} MiB)",
            task.label(),
            tool,
            permits,
            memory_permits
        );
        debug!("{} {}", task.label(), command.display());

        let output = match timeout(self.max_time, self.runner.run(command)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::TimedOut {
                    tool,
                    limit: self.max_time,
                });
            }
        };

        if !output.stderr_tail.is_empty() {
            debug!("{} {} stderr:\n{}", task.label(), tool, output.stderr_tail);
        }
        if let Some(missing) = command.outputs.iter().find(|p| !p.exists()) {
            return Err(ToolError::MissingOutput {
                tool,
                path: missing.clone(),
            });
        }
        Ok(output)
    }

    /// Runs in-process CPU work (parsing, plotting) on the blocking pool under one CPU permit.
    pub async fn execute_blocking<T, F>(&self, stage: Stage, sample: &str, label: &str, work: F) -> Result<T, ToolError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let started = Instant::now();
        let task = StageTask::for_sample(stage, sample, ToolCommand::new(label));
        let result: Result<T, ToolError> = async {
            let _permit = self.cpu_budget.acquire().await.map_err(|e| ToolError::Io {
                tool: label.to_string(),
                error: format!("CPU budget unavailable: {}", e),
            })?;
            info!("{} running {}", task.label(), label);
            match tokio::task::spawn_blocking(work).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ToolError::Io {
                    tool: label.to_string(),
                    error: format!("{:#}", e),
                }),
                Err(e) => Err(ToolError::Io {
                    tool: label.to_string(),
                    error: format!("worker panicked: {}", e),
                }),
            }
        }
        .await;
        self.record(&task, label, started, result.as_ref().err());
        result
    }

    fn record(&self, task: &StageTask, tool: &str, started: Instant, error: Option<&ToolError>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match error {
            None => info!("{} {} finished in {} ms", task.label(), tool, elapsed_ms),
            Some(e) => warn!("{} {} failed: {}", task.label(), tool, e),
        }
        self.ledger.record(TaskRecord {
            stage: task.stage,
            sample: task.sample.clone(),
            tool: tool.to_string(),
            status: if error.is_none() { TaskStatus::Succeeded } else { TaskStatus::Failed },
            elapsed_ms,
            error: error.map(|e| e.to_string()),
        });
    }
}
