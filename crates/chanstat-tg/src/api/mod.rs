//! Authenticated access to the analytics backend

mod client;
mod login;
mod model;
mod session;
mod signing;

pub(crate) use client::*;
pub(crate) use login::*;
pub(crate) use model::*;
pub(crate) use session::*;
pub(crate) use signing::*;

pub(crate) const LOGIN_PATH: &str = "/api/Login/Login";
pub(crate) const PACKAGE_LIST_PATH: &str = "/api/Package/GetPageList";
pub(crate) const PACKAGE_ANALYSIS_PATH: &str = "/api/RptDataAnalysis/GetPackageAnalysis";

/// The API base URL is the login URL without the login endpoint path
pub(crate) fn base_url(login_url: &str) -> String {
    let login_url = login_url.trim().trim_end_matches('/');
    login_url
        .strip_suffix(LOGIN_PATH)
        .unwrap_or(login_url)
        .to_owned()
}

/// Selects the per-request timeout. A human waits for interactive requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Urgency {
    Background,
    Interactive,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error("The API rejected a freshly issued access token ({endpoint})")]
    Authentication { endpoint: String },

    #[error("The API is unavailable ({endpoint})")]
    UpstreamUnavailable {
        endpoint: String,
        source: crate::Error,
    },

    #[error("The API returned an error response ({endpoint}, code: {code}): {msg}")]
    UnexpectedResponse {
        endpoint: String,
        code: i64,
        msg: String,
    },

    #[error("The API kept returning full pages for {endpoint} after {max_pages} pages")]
    TooManyPages { endpoint: String, max_pages: u32 },
}
