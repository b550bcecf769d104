//! Stateless HTTP POST transport

use super::{SendReport, TransportAdapter, TransportOptions};
use crate::client::TransportType;
use crate::types::{BatchResponse, LogEntry, QueuedMessage};
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;
use url::Url;

#[derive(Serialize)]
struct BatchBody<'a> {
    entries: Vec<&'a LogEntry>,
}

/// Posts single entries to `/api/v1/log` and batches to `/api/v1/logs`
pub struct HttpTransport {
    client: reqwest::Client,
    single_url: Url,
    batch_url: Url,
    ready: bool,
}

impl HttpTransport {
    /// Build a transport for the server at `options.url`.
    ///
    /// Only the origin of the URL is used.
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let base = Url::parse(&options.url).map_err(|e| {
            LogBeamError::Config(format!("Invalid server URL {}: {}", options.url, e))
        })?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| LogBeamError::Config(format!("Invalid server URL: {}", e)))
        };

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| LogBeamError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            single_url: join("/api/v1/log")?,
            batch_url: join("/api/v1/logs")?,
            ready: false,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &Url, body: &T) -> Result<reqwest::Response> {
        self.client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| LogBeamError::Transport(format!("HTTP request failed: {}", e)))
    }

    async fn send_one(&self, entry: &LogEntry) -> Result<SendReport> {
        let response = self.post(&self.single_url, entry).await?;
        let ids = vec![entry.id.clone()];
        match refusal(response.status(), &self.single_url)? {
            None => Ok(SendReport::delivered()),
            Some(Refusal::Retry) => Ok(SendReport {
                retry: ids,
                ..Default::default()
            }),
            Some(Refusal::Reject) => Ok(SendReport {
                rejected: ids,
                ..Default::default()
            }),
        }
    }

    async fn send_batch(&self, entries: Vec<&LogEntry>) -> Result<SendReport> {
        debug!("Posting batch of {} entries", entries.len());
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let response = self.post(&self.batch_url, &BatchBody { entries }).await?;

        match refusal(response.status(), &self.batch_url)? {
            Some(Refusal::Retry) => {
                return Ok(SendReport {
                    retry: ids,
                    ..Default::default()
                })
            }
            Some(Refusal::Reject) => {
                return Ok(SendReport {
                    rejected: ids,
                    ..Default::default()
                })
            }
            None => {}
        }

        let body: BatchResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!("Unreadable batch response, assuming delivery: {}", e);
                return Ok(SendReport::delivered());
            }
        };
        Ok(report_from_results(&ids, body))
    }
}

/// How the server refused a whole request
enum Refusal {
    /// Try the same entries later
    Retry,
    /// The entries can never be accepted
    Reject,
}

/// Classify a response status; `Err` for statuses that say nothing about the entries
fn refusal(status: StatusCode, url: &Url) -> Result<Option<Refusal>> {
    if status.is_success() {
        return Ok(None);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => Ok(Some(Refusal::Retry)),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY => {
            Ok(Some(Refusal::Reject))
        }
        _ => Err(LogBeamError::Transport(format!("HTTP {} from {}", status, url))),
    }
}

/// Split per-entry results into retryable and permanent refusals
fn report_from_results(ids: &[String], body: BatchResponse) -> SendReport {
    let mut report = SendReport::delivered();
    for (index, result) in body.results.into_iter().enumerate() {
        if result.ok {
            continue;
        }
        let id = if result.id.is_empty() {
            match ids.get(index) {
                Some(id) => id.clone(),
                None => continue,
            }
        } else {
            result.id
        };
        if result.error_code.is_some_and(|code| code.is_retryable()) {
            report.retry.push(id);
        } else {
            report.rejected.push(id);
        }
    }
    report
}

#[async_trait]
impl TransportAdapter for HttpTransport {
    fn kind(&self) -> TransportType {
        TransportType::Http
    }

    async fn connect(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
        if !self.ready {
            return Err(LogBeamError::Transport("HTTP transport not connected".to_string()));
        }

        match messages {
            [] => Ok(SendReport::delivered()),
            [single] => self.send_one(single.entry()).await,
            _ => {
                self.send_batch(messages.iter().map(QueuedMessage::entry).collect())
                    .await
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.ready = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryResult, ErrorCode};

    #[test]
    fn test_batch_results_split_by_code() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let body = BatchResponse {
            ok: true,
            results: vec![
                EntryResult::accepted("a"),
                EntryResult::rejected("b", ErrorCode::RateLimited, "Rate limit exceeded"),
                EntryResult::rejected("c", ErrorCode::ValidationFailed, "too many tags"),
                // undecodable items come back without an id
                EntryResult::rejected("", ErrorCode::ValidationFailed, "missing field"),
            ],
        };

        let report = report_from_results(&ids, body);
        assert_eq!(report.retry, vec!["b".to_string()]);
        assert_eq!(report.rejected, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_status_classification() {
        let url = Url::parse("http://localhost/api/v1/logs").unwrap();
        assert!(refusal(StatusCode::OK, &url).unwrap().is_none());
        assert!(matches!(
            refusal(StatusCode::TOO_MANY_REQUESTS, &url),
            Ok(Some(Refusal::Retry))
        ));
        assert!(matches!(
            refusal(StatusCode::BAD_REQUEST, &url),
            Ok(Some(Refusal::Reject))
        ));
        assert!(refusal(StatusCode::INTERNAL_SERVER_ERROR, &url).is_err());
    }
}
