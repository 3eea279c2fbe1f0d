use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::oops::OopsReport;

pub trait OopsPublisher: Send + Sync {
    fn publish(&self, report: &OopsReport) -> Result<()>;
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    reports: Mutex<Vec<OopsReport>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<OopsReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn find(&self, id: &str) -> Option<OopsReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

impl OopsPublisher for MemoryPublisher {
    fn publish(&self, report: &OopsReport) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl OopsPublisher for LogPublisher {
    fn publish(&self, report: &OopsReport) -> Result<()> {
        tracing::error!(
            oops_id = %report.id,
            kind = %report.kind,
            operation = report.operation.as_deref().unwrap_or("unknown"),
            "{}",
            report.value
        );
        Ok(())
    }
}

/// Writes each report to `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    dir: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn load(&self, id: &str) -> Result<OopsReport> {
        let raw = std::fs::read(self.path_for(id))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

impl OopsPublisher for DirectoryPublisher {
    fn publish(&self, report: &OopsReport) -> Result<()> {
        let body = serde_json::to_vec_pretty(report)?;
        std::fs::write(self.path_for(&report.id), body)?;
        tracing::info!(oops_id = %report.id, dir = %self.dir.display(), "OOPS written");
        Ok(())
    }
}
