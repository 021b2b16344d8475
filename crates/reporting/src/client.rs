use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use occupancy::{CountReporter, HourlySummary, ReportOutcome};
use reqwest::{
    StatusCode, Url,
    blocking::{Client, RequestBuilder},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid collector endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportingConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Upper bound for a single delivery attempt.
    pub timeout: Duration,
    /// Probe target for [`ReportingClient::health_check`]. Derived from the
    /// endpoint when unset.
    pub health_url: Option<String>,
}

impl ReportingConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
            health_url: None,
        }
    }

    /// `/api/count` collectors expose their liveness probe at `/health`.
    pub fn resolved_health_url(&self) -> String {
        match &self.health_url {
            Some(url) => url.clone(),
            None => self.endpoint.replace("/api/count", "/health"),
        }
    }
}

/// Wire body for a count report.
#[derive(Debug, Serialize)]
struct CountPayload<'a> {
    timestamp: NaiveDateTime,
    hourly_count: u64,
    daily_count: u64,
    total_count: u64,
    device_id: &'a str,
    location: &'a str,
}

impl<'a> CountPayload<'a> {
    fn new(summary: &'a HourlySummary, timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            hourly_count: summary.hourly_count,
            daily_count: summary.daily_count,
            total_count: summary.total_count,
            device_id: &summary.device_id,
            location: &summary.location,
        }
    }
}

/// Single-attempt HTTP reporter. Every call makes exactly one request and
/// turns any failure into a [`ReportOutcome`] rather than an error.
#[derive(Debug, Clone)]
pub struct ReportingClient {
    config: ReportingConfig,
    client: Client,
}

impl ReportingClient {
    pub fn new(config: ReportingConfig) -> Result<Self, ReportError> {
        validate_url(&config.endpoint)?;
        validate_url(&config.resolved_health_url())?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ReportingConfig {
        &self.config
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    pub fn report(&self, summary: &HourlySummary) -> ReportOutcome {
        let payload = CountPayload::new(summary, Local::now().naive_local());
        debug!(
            endpoint = %self.config.endpoint,
            hourly_count = payload.hourly_count,
            daily_count = payload.daily_count,
            "sending count report"
        );

        let request = self.authorized(self.client.post(&self.config.endpoint).json(&payload));
        let outcome = match request.send() {
            Ok(response) if response.status() == StatusCode::OK => {
                let body = response.text().unwrap_or_default();
                info!(body = %body, "count report accepted");
                ReportOutcome::success(body)
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().unwrap_or_default();
                error!(%status, body = %body, "collector rejected count report");
                ReportOutcome::failure(format!("{}: {body}", status.as_u16()))
            }
            Err(err) if err.is_timeout() => {
                error!(timeout = ?self.config.timeout, "count report timed out");
                ReportOutcome::failure("timeout")
            }
            Err(err) if err.is_connect() => {
                error!("could not connect to collector: {err}");
                ReportOutcome::failure("connection error")
            }
            Err(err) => {
                error!("count report failed: {err}");
                ReportOutcome::failure(err.to_string())
            }
        };

        let label = if outcome.ok { "ok" } else { "failed" };
        metrics::counter!("reporting_attempts_total", "outcome" => label).increment(1);
        outcome
    }

    /// Probe collector reachability. Independent of count delivery.
    pub fn health_check(&self) -> bool {
        let url = self.config.resolved_health_url();
        let request = self.authorized(self.client.get(&url).timeout(HEALTH_TIMEOUT));
        match request.send() {
            Ok(response) if response.status() == StatusCode::OK => {
                info!(%url, "collector reachable");
                true
            }
            Ok(response) => {
                warn!(%url, status = %response.status(), "collector health probe failed");
                false
            }
            Err(err) => {
                warn!(%url, "collector health probe failed: {err}");
                false
            }
        }
    }
}

impl CountReporter for ReportingClient {
    fn report(&self, summary: &HourlySummary) -> ReportOutcome {
        ReportingClient::report(self, summary)
    }
}

fn validate_url(raw: &str) -> Result<(), ReportError> {
    let invalid = |reason: String| ReportError::InvalidEndpoint {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_derives_from_count_endpoint() {
        let config = ReportingConfig::new("http://collector:8000/api/count");
        assert_eq!(config.resolved_health_url(), "http://collector:8000/health");

        let explicit = ReportingConfig {
            health_url: Some("http://collector:8000/ping".into()),
            ..config
        };
        assert_eq!(explicit.resolved_health_url(), "http://collector:8000/ping");
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let err = ReportingClient::new(ReportingConfig::new("ftp://collector/api/count")).unwrap_err();
        assert!(matches!(err, ReportError::InvalidEndpoint { .. }));
        assert!(ReportingClient::new(ReportingConfig::new("not a url")).is_err());
    }

    #[test]
    fn payload_carries_summary_fields_and_timestamp() {
        let summary = HourlySummary {
            hourly_count: 12,
            daily_count: 40,
            total_count: 900,
            device_id: "cam-1".into(),
            location: "lobby".into(),
        };
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 6, 3)
            .and_then(|d| d.and_hms_opt(11, 0, 0))
            .unwrap();
        let value = serde_json::to_value(CountPayload::new(&summary, ts)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "timestamp": "2024-06-03T11:00:00",
                "hourly_count": 12,
                "daily_count": 40,
                "total_count": 900,
                "device_id": "cam-1",
                "location": "lobby",
            })
        );
    }
}
