//! JSONL file sink

use crate::sink::{SinkResult, SummarySink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use telcorr_core::config::JsonlExportConfig;
use telcorr_core::CorrelationSummary;
use tracing::info;

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each window
    pub flush_each: bool,
}

impl From<&JsonlExportConfig> for JsonlSinkConfig {
    fn from(config: &JsonlExportConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            append: config.append,
            flush_each: config.flush_each,
        }
    }
}

/// Writes one summary per line
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<BufWriter<File>>,
    summaries_written: AtomicU64,
}

impl JsonlSink {
    /// Open the output file
    pub fn open(config: JsonlSinkConfig) -> SinkResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };

        info!("JSONL sink writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            summaries_written: AtomicU64::new(0),
        })
    }

    pub fn summaries_written(&self) -> u64 {
        self.summaries_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SummarySink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export_summaries(&self, summaries: &[CorrelationSummary]) -> SinkResult<()> {
        // Serialize before taking the lock so a bad summary writes nothing
        let lines = summaries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut w = self.writer.lock();
        for line in &lines {
            writeln!(w, "{}", line)?;
        }
        if self.config.flush_each {
            w.flush()?;
        }

        self.summaries_written
            .fetch_add(lines.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> SinkResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::tests::summary;

    #[tokio::test]
    async fn test_writes_one_line_per_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("summaries.jsonl");
        let sink = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            append: true,
            flush_each: true,
        })
        .unwrap();

        sink.export_summaries(&[summary("a"), summary("b")])
            .await
            .unwrap();
        sink.export_summaries(&[summary("c")]).await.unwrap();
        assert_eq!(sink.summaries_written(), 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<CorrelationSummary> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].primary_key.value, "c");
    }

    #[tokio::test]
    async fn test_truncates_without_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.jsonl");
        std::fs::write(&path, "stale\n").unwrap();

        let sink = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            append: false,
            flush_each: false,
        })
        .unwrap();
        sink.export_summaries(&[summary("fresh")]).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(!content.contains("stale"));
    }
}
