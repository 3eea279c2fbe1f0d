use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobId;

/// One task handed to the external queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub job_id: JobId,
    pub module: String,
    pub class_name: String,
    pub dbuser: String,
    pub queue: String,
    pub eta: DateTime<Utc>,
    /// Seconds
    pub soft_time_limit: f64,
    pub task_id: String,
}

pub trait TaskQueue: Send + Sync {
    fn submit(&self, task: &TaskSubmission) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: Mutex<Vec<TaskSubmission>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<TaskSubmission> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TaskQueue for MemoryTaskQueue {
    fn submit(&self, task: &TaskSubmission) -> Result<()> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        Ok(())
    }
}

/// Writes each task to `<dir>/<task_id>.json` for a queue bridge to pick up.
#[derive(Debug, Clone)]
pub struct SpoolTaskQueue {
    dir: PathBuf,
}

impl SpoolTaskQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pending(&self) -> Result<Vec<TaskSubmission>> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                tasks.push(serde_json::from_slice(&std::fs::read(&path)?)?);
            }
        }
        tasks.sort_by(|a: &TaskSubmission, b| a.eta.cmp(&b.eta));
        Ok(tasks)
    }
}

impl TaskQueue for SpoolTaskQueue {
    fn submit(&self, task: &TaskSubmission) -> Result<()> {
        let path = self.dir.join(format!("{}.json", task.task_id));
        std::fs::write(&path, serde_json::to_vec_pretty(task)?)?;
        Ok(())
    }
}
