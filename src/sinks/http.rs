//! HTTP sink: POSTs JSON documents to a remote archival service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::ledger::RecordView;
use crate::sinks::{ArchiveSink, ExportSink, SinkError};
use crate::subject::ExportBundle;

#[derive(Debug, Deserialize)]
struct LocationResponse {
    location: Option<String>,
}

pub struct HttpSink {
    base_url: String,
    http_client: Client,
}

impl HttpSink {
    pub fn new(base_url: String) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<String, SinkError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SinkError::Unavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(SinkError::Rejected(format!("{} returned {}", url, status)));
        }

        // Services may name the stored object; otherwise the URL is the location
        let location = response
            .json::<LocationResponse>()
            .await
            .ok()
            .and_then(|r| r.location)
            .unwrap_or(url);

        info!("Stored document at {}", location);
        Ok(location)
    }
}

#[async_trait]
impl ArchiveSink for HttpSink {
    async fn archive(&self, view: &RecordView) -> Result<String, SinkError> {
        self.post(&format!("records/{}", view.sequence), view).await
    }
}

#[async_trait]
impl ExportSink for HttpSink {
    async fn write_export(&self, bundle: &ExportBundle) -> Result<String, SinkError> {
        self.post(&format!("exports/{}", bundle.request_id), bundle)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ActionKind, ActorRef, EventCandidate, LedgerStore, Target};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sample_view() -> RecordView {
        let store = LedgerStore::in_memory();
        store
            .append(EventCandidate::new(
                ActorRef::principal("staff-1"),
                ActionKind::Delete,
                Target::new("inventory.batch", "77"),
            ))
            .await
            .unwrap()
            .view()
    }

    #[tokio::test]
    async fn test_archive_returns_service_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records/1"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"location": "s3://archive/1"})),
            )
            .mount(&server)
            .await;

        let sink = HttpSink::new(server.uri());
        let location = sink.archive(&sample_view().await).await.unwrap();
        assert_eq!(location, "s3://archive/1");
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpSink::new(server.uri());
        let err = sink.archive(&sample_view().await).await.unwrap_err();
        assert!(matches!(err, SinkError::Unavailable(_)));
    }
}
