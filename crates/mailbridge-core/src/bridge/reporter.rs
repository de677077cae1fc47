//! Telemetry sink for failures the bridge cannot handle silently.

use std::collections::BTreeMap;

use tracing::error;

use crate::Result;

/// Structured context attached to a report.
pub type ReportContext = BTreeMap<String, serde_json::Value>;

/// Fire-and-forget sink of failure reports.
pub trait Reporter: Send + Sync {
    /// Send a report.
    ///
    /// # Errors
    ///
    /// Returns an error if the report could not be delivered. Callers log it.
    fn report_message_with_context(&self, message: &str, context: &ReportContext) -> Result<()>;
}

/// Reporter that writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report_message_with_context(&self, message: &str, context: &ReportContext) -> Result<()> {
        let context = serde_json::to_string(context)?;
        error!(
            reported_at = %chrono::Utc::now().to_rfc3339(),
            context = %context,
            "{message}"
        );
        Ok(())
    }
}
