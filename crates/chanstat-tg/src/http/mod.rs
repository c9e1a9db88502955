mod basic_ext;
mod json_ext;

use crate::config::HttpConfig;
use crate::prelude::*;
use crate::Result;
use async_trait::async_trait;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use std::time::Instant;

pub(crate) mod prelude {
    pub(crate) use super::basic_ext::RequestBuilderBasicExt;
    pub(crate) use super::json_ext::RequestBuilderJsonExt;
}

pub type Client = reqwest_middleware::ClientWithMiddleware;

/// Retry exponentially increasing intervals between attempts.
/// Timeouts, connection errors, `5xx`, `408` and `429` are considered transient.
pub(crate) fn retry_policy(config: &HttpConfig) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(config.retry.min_backoff, config.retry.max_backoff)
        .build_with_max_retries(config.retry.max_retries)
}

pub(crate) fn create_client(config: &HttpConfig) -> Result<Client> {
    build_client(config, true)
}

/// Client for the requests that need to be rebuilt on every attempt (e.g.
/// signed ones with a nonce). Such requests are retried with
/// [`crate::util::retry::retry_http`] instead of the retry middleware.
pub(crate) fn create_client_without_retries(config: &HttpConfig) -> Result<Client> {
    build_client(config, false)
}

fn build_client(config: &HttpConfig, retry_transient: bool) -> Result<Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.ssl_verify)
        .connect_timeout(config.connect_timeout)
        .user_agent(concat!("chanstat-tg/", env!("CARGO_PKG_VERSION")))
        .build()
        .fatal_ctx(|| "Failed to build the HTTP client")?;

    let mut client =
        reqwest_middleware::ClientBuilder::new(client).with(OutermostObservingMiddleware);

    if retry_transient {
        client = client.with(RetryTransientMiddleware::new_with_policy(retry_policy(
            config,
        )));
    }

    Ok(client.with(InnermostObservingMiddleware).build())
}

/// Whether the error is a transient HTTP failure worth retrying
pub(crate) fn is_transient(err: &crate::Error) -> bool {
    matches!(err.kind(), crate::error::ErrorKind::HttpClient { source } if source.is_transient())
}

struct OutermostObservingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for OutermostObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let span = info_span!(
            "request",
            version = ?request.version(),
            method = %request.method(),
            url = %request.url(),
        );
        measure_request(
            "http_request_effective_duration_seconds",
            request,
            extensions,
            next,
        )
        .instrument(span)
        .await
    }
}

struct InnermostObservingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for InnermostObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let start = Instant::now();
        let result =
            measure_request("http_request_duration_seconds", request, extensions, next).await;
        let duration = tracing_duration(start.elapsed());

        let response = match &result {
            Ok(response) => response,
            Err(err) => {
                error!(duration, err = tracing_err(err), "Network request failed");
                return result;
            }
        };

        let status = response.status();

        let Err(err) = response.error_for_status_ref() else {
            debug!(duration, %status, "Network request succeeded");
            return result;
        };

        warn!(
            err = tracing_err(&err),
            duration,
            %status,
            "Network request failed (error status)"
        );

        result
    }
}

async fn measure_request(
    histogram: &'static str,
    request: reqwest::Request,
    extensions: &mut http::Extensions,
    next: reqwest_middleware::Next<'_>,
) -> reqwest_middleware::Result<reqwest::Response> {
    let method = request.method().to_string();
    let host = request.url().host_str().unwrap_or("{unknown}").to_owned();

    let start = Instant::now();
    let result = next.run(request, extensions).await;
    let elapsed = start.elapsed();

    let status = match &result {
        Ok(response) => response.status().as_u16().to_string(),
        Err(_) => "{fatal}".to_owned(),
    };

    metrics::histogram!(
        histogram,
        elapsed,
        "method" => method,
        "host" => host,
        "status" => status,
    );

    result
}

/// Errors at the layer of the HTTP API
#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpClientError {
    #[error("HTTP request failed")]
    Request { source: reqwest_middleware::Error },

    #[error("Failed to read HTTP response")]
    ReadPayload { source: reqwest::Error },

    #[error("HTTP request has failed (HTTP status code: {status}):\n{body}")]
    BadResponseStatusCode {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Received an unexpected response JSON object")]
    UnexpectedResponseJsonShape { source: serde_json::Error },
}

impl HttpClientError {
    /// Timeouts, connection errors, `5xx`, `408` and `429`
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            HttpClientError::Request { source } => match source {
                reqwest_middleware::Error::Reqwest(err) => err.is_timeout() || err.is_connect(),
                reqwest_middleware::Error::Middleware(_) => false,
            },
            HttpClientError::BadResponseStatusCode { status, .. } => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            HttpClientError::ReadPayload { .. }
            | HttpClientError::UnexpectedResponseJsonShape { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::http_config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test_log::test(tokio::test)]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_client(&http_config()).unwrap();

        let response = client
            .post(format!("{}/flaky", server.uri()))
            .try_send()
            .await
            .unwrap();

        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_are_transient_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = create_client(&http_config()).unwrap();

        let err = client
            .post(format!("{}/down", server.uri()))
            .try_send()
            .await
            .unwrap_err();

        let crate::error::ErrorKind::HttpClient { source } = err.kind() else {
            panic!("unexpected error: {err:?}");
        };
        assert!(source.is_transient());
    }

    #[test_log::test(tokio::test)]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_client(&http_config()).unwrap();

        let err = client
            .post(format!("{}/bad", server.uri()))
            .try_send()
            .await
            .unwrap_err();

        let crate::error::ErrorKind::HttpClient { source } = err.kind() else {
            panic!("unexpected error: {err:?}");
        };
        assert!(!source.is_transient());
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[test_log::test(tokio::test)]
    async fn client_without_retries_sends_once() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_client_without_retries(&http_config()).unwrap();

        let err = client
            .post(format!("{}/down", server.uri()))
            .try_send()
            .await
            .unwrap_err();

        assert!(is_transient(&err), "{err:?}");
    }
}
