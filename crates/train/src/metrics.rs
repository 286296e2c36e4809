//! JSON-lines metrics log.

use anyhow::{Context, Result};
use policyforge_model::{HeadMetrics, PolicyMetrics};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub step: usize,
    pub split: Split,
    pub loss: f32,
    pub heads: BTreeMap<String, HeadMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f32>,
    pub unix_ms: u128,
}

impl MetricsRecord {
    pub fn new(step: usize, split: Split, metrics: &PolicyMetrics) -> Self {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();
        Self {
            step,
            split,
            loss: metrics.loss,
            heads: metrics.heads.clone(),
            learning_rate: None,
            grad_norm: None,
            unix_ms,
        }
    }

    pub fn with_optimizer(mut self, learning_rate: f32, grad_norm: f32) -> Self {
        self.learning_rate = Some(learning_rate);
        self.grad_norm = Some(grad_norm);
        self
    }
}

/// Appends one JSON object per line and flushes after each record.
pub struct MetricsWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl MetricsWriter {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(METRICS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &MetricsRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

pub fn read_metrics(path: impl AsRef<Path>) -> Result<Vec<MetricsRecord>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    BufReader::new(file)
        .lines()
        .filter(|line| line.as_ref().map(|l| !l.trim().is_empty()).unwrap_or(true))
        .enumerate()
        .map(|(i, line)| {
            let line = line?;
            serde_json::from_str(&line).with_context(|| format!("{}:{}: invalid metrics record", path.display(), i + 1))
        })
        .collect()
}

/// Mean of several evaluation results, head by head.
pub fn average_metrics(results: &[PolicyMetrics]) -> PolicyMetrics {
    let mut averaged = PolicyMetrics::default();
    if results.is_empty() {
        return averaged;
    }
    let n = results.len() as f32;
    averaged.loss = results.iter().map(|m| m.loss).sum::<f32>() / n;
    let mut heads: BTreeMap<String, Vec<&HeadMetrics>> = BTreeMap::new();
    for result in results {
        for (name, head) in &result.heads {
            heads.entry(name.clone()).or_default().push(head);
        }
    }
    for (name, entries) in heads {
        let count = entries.len() as f32;
        let accuracies: Vec<f32> = entries.iter().filter_map(|h| h.accuracy).collect();
        let head = HeadMetrics {
            loss: entries.iter().map(|h| h.loss).sum::<f32>() / count,
            mse: entries.iter().map(|h| h.mse).sum::<f32>() / count,
            accuracy: (!accuracies.is_empty())
                .then(|| accuracies.iter().sum::<f32>() / accuracies.len() as f32),
            supervised: entries.iter().map(|h| h.supervised).sum::<f32>(),
        };
        averaged.heads.insert(name, head);
    }
    averaged
}
