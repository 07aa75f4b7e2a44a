use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::AppResult;

const ROLLING_WINDOW: usize = 50;

/// Outcome of one provider call, keyed by an operation id so audit lines can
/// be correlated with traces.
#[derive(Debug, Clone, Serialize)]
pub struct CallSample {
    pub operation_id: String,
    pub provider: String,
    pub success: bool,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageSummary {
    pub samples: usize,
    /// 0–1 over the rolling window.
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Rolling per-provider usage metrics. The health monitor scores providers
/// without probe endpoints from these aggregates instead of parsing logs.
/// An optional JSONL audit buffer keeps a size-bounded on-disk trail.
pub struct UsageRecorder {
    windows: Mutex<HashMap<String, VecDeque<CallSample>>>,
    audit: Option<AuditBuffer>,
}

struct AuditBuffer {
    path: PathBuf,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl UsageRecorder {
    pub fn in_memory() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    /// Recorder with a JSONL audit trail under `data_dir`.
    pub fn with_audit<P: AsRef<Path>>(
        data_dir: P,
        max_file_bytes: u64,
        max_file_count: usize,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("usage-audit.jsonl");
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            windows: Mutex::new(HashMap::new()),
            audit: Some(AuditBuffer {
                path,
                max_file_bytes,
                max_file_count: max_file_count.max(1),
            }),
        })
    }

    pub fn record(&self, operation_id: &str, provider: &str, success: bool, latency_ms: u64) {
        let sample = CallSample {
            operation_id: operation_id.to_string(),
            provider: provider.to_string(),
            success,
            latency_ms,
            timestamp: Utc::now(),
        };

        {
            let mut windows = self.windows.lock();
            let window = windows.entry(provider.to_string()).or_default();
            window.push_back(sample.clone());
            while window.len() > ROLLING_WINDOW {
                window.pop_front();
            }
        }

        if let Some(audit) = &self.audit {
            // audit is best-effort; metrics stay correct even if the disk is
            // unhappy
            let _ = audit.append(&sample);
        }
    }

    pub fn summary(&self, provider: &str) -> UsageSummary {
        let windows = self.windows.lock();
        let Some(window) = windows.get(provider) else {
            return UsageSummary::default();
        };
        if window.is_empty() {
            return UsageSummary::default();
        }
        let successes = window.iter().filter(|s| s.success).count();
        let total_latency: u64 = window.iter().map(|s| s.latency_ms).sum();
        UsageSummary {
            samples: window.len(),
            success_rate: successes as f64 / window.len() as f64,
            avg_latency_ms: total_latency as f64 / window.len() as f64,
        }
    }

    pub fn providers_seen(&self) -> Vec<String> {
        self.windows.lock().keys().cloned().collect()
    }
}

impl AuditBuffer {
    fn append(&self, sample: &CallSample) -> AppResult<()> {
        let line = serde_json::to_vec(sample)?;
        self.rotate_if_needed((line.len() + 1) as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            return Ok(());
        }

        let rotated_name = format!(
            "{}-{}.jsonl",
            self.stem(),
            Utc::now().format("%Y%m%d%H%M%S%f")
        );
        let rotated_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(rotated_name);
        if self.path.exists() {
            fs::rename(&self.path, &rotated_path)?;
        }
        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(|entry| {
                entry.ok().and_then(|dir_entry| {
                    let name = dir_entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                        Some((
                            dir_entry.path(),
                            dir_entry.metadata().ok()?.modified().ok()?,
                        ))
                    } else {
                        None
                    }
                })
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|(_, modified)| *modified);
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (path, _) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "usage-audit".into())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn summary_reflects_rolling_window() {
        let recorder = UsageRecorder::in_memory();
        for i in 0..10 {
            recorder.record("op", "overpass", i % 2 == 0, 100 + i);
        }
        let summary = recorder.summary("overpass");
        assert_eq!(summary.samples, 10);
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
        assert!(summary.avg_latency_ms > 100.0);
        assert_eq!(recorder.summary("unknown").samples, 0);
    }

    #[test]
    fn window_is_bounded() {
        let recorder = UsageRecorder::in_memory();
        for _ in 0..(ROLLING_WINDOW + 25) {
            recorder.record("op", "geoapify", true, 50);
        }
        assert_eq!(recorder.summary("geoapify").samples, ROLLING_WINDOW);
    }

    #[test]
    fn audit_buffer_writes_and_rotates() {
        let dir = tempdir().unwrap();
        let recorder = UsageRecorder::with_audit(dir.path(), 256, 2).unwrap();
        for i in 0..50 {
            recorder.record(&format!("op-{i}"), "overpass", true, 10);
        }
        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".jsonl"))
            .collect();
        // live buffer plus at most one retained rotation
        assert!(!files.is_empty());
        assert!(files.len() <= 2);
    }
}
