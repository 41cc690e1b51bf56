//! Outbound failure reports
//!
//! Failed web captures can be reported to a diagnostics endpoint when the
//! user opted in. The report carries no user data: translator id, its
//! last-updated stamp, a system description and the error dump.

use crate::core::config::ReportingConfig;
use crate::core::error::{ErrorReport, Result, TranslateError};
use std::time::Duration;
use tracing::{debug, info};

/// Destination for failure reports
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: &ErrorReport) -> Result<()>;
}

/// Form-encoded POST to a fixed endpoint
pub struct HttpReporter {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpReporter {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TranslateError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Reporter for the configured endpoint; `None` when reporting is off
    pub fn from_config(config: &ReportingConfig) -> Result<Option<Self>> {
        if config.endpoint.trim().is_empty() {
            debug!("No reporting endpoint configured");
            return Ok(None);
        }
        Self::new(config.endpoint.clone(), Duration::from_secs(config.timeout_secs)).map(Some)
    }
}

impl ErrorReporter for HttpReporter {
    fn report(&self, report: &ErrorReport) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .form(&report.form_fields())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| TranslateError::Network(format!("failure report not sent: {}", e)))?;
        info!(trace_id = %report.trace_id, "Sent translation failure report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoint_disables_reporting() {
        let config = ReportingConfig {
            endpoint: "  ".to_string(),
            timeout_secs: 5,
        };
        assert!(HttpReporter::from_config(&config).unwrap().is_none());

        let config = ReportingConfig {
            endpoint: "https://reports.example.org/submit".to_string(),
            timeout_secs: 5,
        };
        assert!(HttpReporter::from_config(&config).unwrap().is_some());
    }
}
