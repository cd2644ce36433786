//! Learning time data sources.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use courier_core::CustomerId;
use serde::Deserialize;

use super::EnrichmentError;

/// Black-box lookup of total learning time for a learner in a course.
///
/// `Ok(None)` means the source answered but has no data.
#[async_trait]
pub trait LearningTimeSource: Send + Sync + fmt::Debug {
    /// Fetches learning time in seconds.
    async fn fetch(
        &self,
        user_id: i64,
        course_key: &str,
        customer_id: CustomerId,
    ) -> Result<Option<i64>, EnrichmentError>;
}

#[derive(Debug, Deserialize)]
struct LearningTimeBody {
    learning_time_seconds: Option<i64>,
}

/// Source backed by an HTTP analytics service.
///
/// Issues `GET {base_url}/learning-time?user_id=..&course_id=..&customer_id=..`
/// and expects `{"learning_time_seconds": <int|null>}`. A 404 is treated as
/// no data.
#[derive(Debug, Clone)]
pub struct HttpLearningTimeSource {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpLearningTimeSource {
    /// Creates a source for the given base URL.
    ///
    /// The request timeout is a backstop; the adapter enforces its own
    /// lookup timeout.
    ///
    /// # Errors
    ///
    /// Returns `EnrichmentError::Request` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichmentError::Request(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), api_token })
    }
}

#[async_trait]
impl LearningTimeSource for HttpLearningTimeSource {
    async fn fetch(
        &self,
        user_id: i64,
        course_key: &str,
        customer_id: CustomerId,
    ) -> Result<Option<i64>, EnrichmentError> {
        let mut request = self.client.get(format!("{}/learning-time", self.base_url)).query(&[
            ("user_id", user_id.to_string()),
            ("course_id", course_key.to_string()),
            ("customer_id", customer_id.to_string()),
        ]);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EnrichmentError::Timeout
            } else {
                EnrichmentError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(EnrichmentError::Upstream { status: status.as_u16() });
        }

        let body: LearningTimeBody =
            response.json().await.map_err(|e| EnrichmentError::Decode(e.to_string()))?;
        Ok(body.learning_time_seconds.filter(|secs| *secs >= 0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn source(server: &MockServer) -> HttpLearningTimeSource {
        HttpLearningTimeSource::new(server.uri(), Some("analytics-token".into()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn fetches_seconds_with_query_parameters() {
        let server = MockServer::start().await;
        let customer = CustomerId::new();

        Mock::given(matchers::method("GET"))
            .and(matchers::path("/learning-time"))
            .and(matchers::query_param("user_id", "42"))
            .and(matchers::query_param("course_id", "course-v1:edX+DemoX+Demo"))
            .and(matchers::query_param("customer_id", customer.to_string()))
            .and(matchers::header("authorization", "Bearer analytics-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"learning_time_seconds": 7200})))
            .expect(1)
            .mount(&server)
            .await;

        let result = source(&server).await.fetch(42, "course-v1:edX+DemoX+Demo", customer).await;
        assert_eq!(result.unwrap(), Some(7200));
    }

    #[tokio::test]
    async fn null_and_not_found_mean_no_data() {
        let server = MockServer::start().await;

        Mock::given(matchers::query_param("user_id", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"learning_time_seconds": null})))
            .mount(&server)
            .await;
        Mock::given(matchers::query_param("user_id", "2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = source(&server).await;
        assert_eq!(source.fetch(1, "c", CustomerId::new()).await.unwrap(), None);
        assert_eq!(source.fetch(2, "c", CustomerId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source(&server).await.fetch(1, "c", CustomerId::new()).await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Upstream { status: 503 }));
    }
}
