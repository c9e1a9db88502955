use super::{
    base_url, signing, ApiError, Envelope, PackageAnalysisParams, PackageListParams,
    PackageRecord, PageData, RawAnalysisRecord, SessionManager, Token, Urgency,
    PACKAGE_ANALYSIS_PATH, PACKAGE_LIST_PATH,
};
use crate::config::{ApiConfig, ChannelId};
use crate::error::ErrorKind;
use crate::http::HttpClientError;
use crate::prelude::*;
use crate::report::{DateRange, MetricsSource};
use crate::util::retry::retry_http;
use crate::{err, fatal, http, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_retry::policies::ExponentialBackoff;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a single authorized request
enum Reply<T> {
    Data(T),
    Unauthorized,
}

pub(crate) struct ApiClient {
    http: http::Client,
    config: ApiConfig,
    base_url: String,
    session: Arc<SessionManager>,
    retry: ExponentialBackoff,
}

impl ApiClient {
    /// The `http` client must not retry by itself, see
    /// [`http::create_client_without_retries`].
    pub(crate) fn new(http: http::Client, config: ApiConfig, session: Arc<SessionManager>) -> Self {
        let base_url = base_url(&config.login.url);
        let retry = http::retry_policy(&config.http);
        Self {
            http,
            config,
            base_url,
            session,
            retry,
        }
    }

    /// Requests the pages one by one starting from the first one until the
    /// declared total is reached or a page is not full.
    #[instrument(skip_all, fields(endpoint = %endpoint, urgency = %urgency))]
    pub(crate) async fn fetch_page<T: DeserializeOwned + Send>(
        &self,
        endpoint: &str,
        page_params: &(impl Serialize + Sync),
        urgency: Urgency,
    ) -> Result<Vec<T>> {
        let Value::Object(base_params) = serde_json::to_value(page_params)
            .fatal_ctx(|| format!("Failed to serialize page params for {endpoint}"))?
        else {
            return Err(fatal!("Page params for {endpoint} must be a JSON object"));
        };

        let page_size = self.config.page_size;
        let mut records = vec![];

        for page_no in 1..=self.config.max_pages {
            let mut params = base_params.clone();
            params.insert("pageNo".to_owned(), page_no.into());
            params.insert("pageSize".to_owned(), page_size.into());

            let page: PageData<T> = self.call(endpoint, &params, urgency).await?;

            let received = page.list.len();
            records.extend(page.list);

            debug!(page_no, received, total = page.total, "Received a page");

            let reached_total = page
                .total
                .is_some_and(|total| records.len() as u64 >= total);

            if received < page_size as usize || reached_total {
                return Ok(records);
            }
        }

        Err(err!(ApiError::TooManyPages {
            endpoint,
            max_pages: self.config.max_pages,
        }))
    }

    /// Package id to channel name mapping
    async fn fetch_package_names(&self, urgency: Urgency) -> Result<HashMap<i64, String>> {
        let params = PackageListParams {
            sort_field: "id",
            order_by: "Desc",
        };

        let packages: Vec<PackageRecord> = self
            .fetch_page(PACKAGE_LIST_PATH, &params, urgency)
            .await?;

        let names = packages
            .into_iter()
            .filter_map(|package| {
                let name = package.channel_package_name?;
                (!name.is_empty()).then_some((package.id, name))
            })
            .collect();

        Ok(names)
    }

    /// Signs the params, sends them with the current token and re-logins
    /// once if the token is rejected.
    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        urgency: Urgency,
    ) -> Result<T> {
        let token = self.session.get_valid_token().await?;

        if let Reply::Data(data) = self.send(endpoint, params, &token, urgency).await? {
            return Ok(data);
        }

        metrics::increment_counter!("api_token_rejections_total", "endpoint" => endpoint.to_owned());
        warn!(endpoint, "The API rejected the access token, logging in again");

        self.session.invalidate(&token).await;

        let token = self.session.get_valid_token().await?;

        match self.send(endpoint, params, &token, urgency).await? {
            Reply::Data(data) => Ok(data),
            Reply::Unauthorized => {
                // The next job run starts with a fresh login
                self.session.invalidate(&token).await;
                Err(err!(ApiError::Authentication { endpoint }))
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        token: &Token,
        urgency: Urgency,
    ) -> Result<Reply<T>> {
        let result = retry_http(
            &self.retry,
            || self.post_signed(endpoint, params, token, urgency),
            http::is_transient,
        )
        .await;

        let envelope = match result {
            Ok(envelope) => envelope,
            Err(err) => return classify_failure(endpoint, err),
        };

        if envelope.is_unauthorized() {
            return Ok(Reply::Unauthorized);
        }

        if !envelope.is_success() {
            return Err(err!(ApiError::UnexpectedResponse {
                endpoint,
                code: envelope.code,
                msg: envelope.msg(),
            }));
        }

        let data = serde_json::from_value(envelope.data)
            .map_err(|source| err!(HttpClientError::UnexpectedResponseJsonShape { source }))?;

        Ok(Reply::Data(data))
    }

    /// Every attempt gets its own timestamp and nonce
    async fn post_signed(
        &self,
        endpoint: &str,
        params: &Map<String, Value>,
        token: &Token,
        urgency: Urgency,
    ) -> Result<Envelope> {
        let body = signing::sign(params, &self.config.signing)?;

        self.http
            .post(format!("{}{endpoint}", self.base_url))
            .timeout(self.timeout(urgency))
            .bearer_auth(token.expose())
            .header("Domainurl", &self.base_url)
            .json(&body)
            .read_json::<Envelope>()
            .await
    }

    fn timeout(&self, urgency: Urgency) -> Duration {
        match urgency {
            Urgency::Background => self.config.timeouts.background,
            Urgency::Interactive => self.config.timeouts.interactive,
        }
    }
}

fn classify_failure<T>(endpoint: &str, err: crate::Error) -> Result<Reply<T>> {
    let ErrorKind::HttpClient { source } = err.kind() else {
        return Err(err);
    };

    if source.is_transient() {
        return Err(err!(ApiError::UpstreamUnavailable {
            endpoint,
            source: err.clone(),
        }));
    }

    let unauthorized = matches!(
        source,
        HttpClientError::BadResponseStatusCode { status, .. }
        if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
    );

    if unauthorized {
        return Ok(Reply::Unauthorized);
    }

    Err(err)
}

#[async_trait]
impl MetricsSource for ApiClient {
    #[instrument(skip_all, fields(channels = channel_filter.len(), range = %range, urgency = %urgency))]
    async fn fetch_analysis(
        &self,
        channel_filter: &[ChannelId],
        range: DateRange,
        urgency: Urgency,
    ) -> Result<Vec<RawAnalysisRecord>> {
        let names = self.fetch_package_names(urgency).await?;

        let params = PackageAnalysisParams {
            start_time: range.start.format("%Y-%m-%d").to_string(),
            end_time: range.end.format("%Y-%m-%d").to_string(),
            order_by: "Desc",
        };

        let records: Vec<RawAnalysisRecord> = self
            .fetch_page(PACKAGE_ANALYSIS_PATH, &params, urgency)
            .await?;

        let total = records.len();

        let records: Vec<_> = records
            .into_iter()
            .map(|mut record| {
                if let Some(name) = record.package_id.and_then(|id| names.get(&id)) {
                    record.package_name = name.clone();
                }
                record
            })
            .filter(|record| {
                channel_filter
                    .iter()
                    .any(|channel| channel.as_str() == record.package_name)
            })
            .collect();

        debug!(total, matched = records.len(), "Fetched the package analysis");

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::login::tests::{api_config, token_response};
    use crate::api::{LoginClient, LOGIN_PATH};
    use crate::report::DateRange;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, page_size: u32) -> ApiClient {
        let mut config = api_config(server);
        config.page_size = page_size;

        let http = http::create_client_without_retries(&config.http).unwrap();
        let login = LoginClient::new(http.clone(), config.clone()).unwrap();
        let session = Arc::new(SessionManager::new(Arc::new(login), config.session.clone()));

        ApiClient::new(http, config, session)
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "msg": "Succeed", "data": data }))
    }

    fn packages(ids: std::ops::Range<i64>) -> Value {
        let list: Vec<_> = ids
            .map(|id| json!({ "id": id, "channelPackageName": format!("CH-{id}") }))
            .collect();
        json!({ "list": list })
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(token_response("t1"))
            .mount(server)
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn pagination_concatenates_pages_in_order() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        for (page_no, ids) in [(1, 0..100), (2, 100..200), (3, 200..237)] {
            Mock::given(method("POST"))
                .and(path(PACKAGE_LIST_PATH))
                .and(header("Authorization", "Bearer t1"))
                .and(body_partial_json(json!({ "pageNo": page_no, "pageSize": 100 })))
                .respond_with(ok(packages(ids)))
                .expect(1)
                .mount(&server)
                .await;
        }

        let params = PackageListParams {
            sort_field: "id",
            order_by: "Desc",
        };

        let records: Vec<PackageRecord> = client(&server, 100)
            .fetch_page(PACKAGE_LIST_PATH, &params, Urgency::Background)
            .await
            .unwrap();

        let ids: Vec<_> = records.iter().map(|record| record.id).collect();
        assert_eq!(ids, (0..237).collect::<Vec<_>>());
    }

    #[test_log::test(tokio::test)]
    async fn declared_total_stops_pagination() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let mut page = packages(0..2);
        page["total"] = json!(2);

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ok(page))
            .expect(1)
            .mount(&server)
            .await;

        let params = PackageListParams {
            sort_field: "id",
            order_by: "Desc",
        };

        let records: Vec<PackageRecord> = client(&server, 2)
            .fetch_page(PACKAGE_LIST_PATH, &params, Urgency::Background)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn rejected_token_causes_exactly_one_relogin() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(token_response("t1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(LOGIN_PATH))
            .respond_with(token_response("t2"))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .and(header("Authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .and(header("Authorization", "Bearer t2"))
            .respond_with(ok(packages(0..3)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 100);

        let names = client
            .fetch_package_names(Urgency::Interactive)
            .await
            .unwrap();

        assert_eq!(names.len(), 3);
        assert_eq!(client.session.snapshot().logins, 2);
    }

    #[test_log::test(tokio::test)]
    async fn second_rejection_is_an_authentication_error() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 401,
                "msg": "Unauthorized",
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server, 100);

        let err = client
            .fetch_package_names(Urgency::Interactive)
            .await
            .unwrap_err();

        assert!(err.is_authentication(), "{err:?}");

        // The twice rejected token is not reused by the next call
        assert_matches!(
            client.session.snapshot().state,
            crate::api::SessionState::Unauthenticated
        );
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_mean_upstream_unavailable() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server, 100)
            .fetch_package_names(Urgency::Background)
            .await
            .unwrap_err();

        assert!(err.is_upstream_unavailable(), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn retried_requests_are_signed_anew() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ok(packages(0..3)))
            .expect(1)
            .mount(&server)
            .await;

        let names = client(&server, 100)
            .fetch_package_names(Urgency::Background)
            .await
            .unwrap();

        assert_eq!(names.len(), 3);

        let nonces: HashSet<_> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path() == PACKAGE_LIST_PATH)
            .map(|request| {
                let body: Value = serde_json::from_slice(&request.body).unwrap();
                body["random"].to_string()
            })
            .collect();

        assert_eq!(nonces.len(), 3, "{nonces:?}");
    }

    #[test_log::test(tokio::test)]
    async fn analysis_resolves_names_and_filters_channels() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_LIST_PATH))
            .respond_with(ok(json!({
                "list": [
                    { "id": 1, "channelPackageName": "FBA8-18" },
                    { "id": 2, "channelPackageName": "FBA8-19" },
                ],
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path(PACKAGE_ANALYSIS_PATH))
            .and(body_partial_json(json!({
                "startTime": "2025-03-01",
                "endTime": "2025-03-01",
                "orderBy": "Desc",
                "pageNo": 1,
            })))
            .respond_with(ok(json!({
                "list": [
                    { "packageId": 1, "packageName": "stale-name", "newMemberCount": 5 },
                    { "packageId": 2, "packageName": "other", "newMemberCount": 6 },
                    { "packageId": 99, "packageName": "FBA8-20", "newMemberCount": 7 },
                ],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        let records = client(&server, 100)
            .fetch_analysis(
                &[ChannelId::from("FBA8-18"), ChannelId::from("FBA8-20")],
                DateRange::day(date),
                Urgency::Background,
            )
            .await
            .unwrap();

        let names: Vec<_> = records
            .iter()
            .map(|record| (record.package_name.as_str(), record.new_member_count))
            .collect();

        assert_eq!(names, [("FBA8-18", 5), ("FBA8-20", 7)]);
    }
}
