//! Audit-log sink: one structured log line per summary

use crate::sink::{SinkResult, SummarySink};
use async_trait::async_trait;
use telcorr_core::CorrelationSummary;
use tracing::info;

#[derive(Debug, Default)]
pub struct AuditSink;

impl AuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SummarySink for AuditSink {
    fn name(&self) -> &str {
        "audit"
    }

    async fn export_summaries(&self, summaries: &[CorrelationSummary]) -> SinkResult<()> {
        for s in summaries {
            info!(
                target: "telcorr::audit",
                summary_id = %s.summary_id,
                correlation_id = %s.correlation_id,
                key = %s.primary_key,
                logs = s.log_count,
                spans = s.span_count,
                errors = s.error_count(),
                confidence = s.confidence_score,
                windows_seen = s.windows_seen,
                parent = s.parent.as_ref().map(|p| p.correlation_id.as_str()).unwrap_or("-"),
                "correlation summary"
            );
        }
        Ok(())
    }
}
