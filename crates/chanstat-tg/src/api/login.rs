use super::{
    base_url, signing, ApiError, Authenticator, Envelope, LoginData, LoginOutcome, LoginRequest,
    Token, LOGIN_PATH,
};
use crate::config::ApiConfig;
use crate::error::ErrorKind;
use crate::prelude::*;
use crate::util::retry::retry_http;
use crate::{err, http, Result};
use async_trait::async_trait;
use reqwest_retry::policies::ExponentialBackoff;
use std::collections::HashSet;
use std::time::Duration;
use totp_rs::{Algorithm, Secret, TOTP};

const TOTP_DIGITS: usize = 6;
const TOTP_STEP: u64 = 30;

/// Logs in with the username, password and a TOTP code
pub(crate) struct LoginClient {
    http: http::Client,
    config: ApiConfig,
    base_url: String,
    totp: TOTP,
    retry: ExponentialBackoff,
}

impl LoginClient {
    /// The `http` client must not retry by itself, see
    /// [`http::create_client_without_retries`].
    pub(crate) fn new(http: http::Client, config: ApiConfig) -> Result<Self> {
        let totp = create_totp(&config.login.totp_secret)?;
        let base_url = base_url(&config.login.url);
        let retry = http::retry_policy(&config.http);

        Ok(Self {
            http,
            config,
            base_url,
            totp,
            retry,
        })
    }

    /// Codes for the configured TOTP windows, duplicates removed
    fn totp_codes(&self, now: u64) -> Vec<(i64, String)> {
        let mut seen = HashSet::new();

        self.config
            .session
            .totp_window_offsets
            .iter()
            .map(|&offset| {
                let time = now.saturating_add_signed(offset * TOTP_STEP as i64);
                (offset, self.totp.generate(time))
            })
            .filter(|(_, code)| seen.insert(code.clone()))
            .collect()
    }

    async fn try_code(&self, code: &str) -> Result<LoginOutcome> {
        let result = retry_http(&self.retry, || self.post_code(code), http::is_transient).await;

        let envelope = match result {
            Ok(envelope) => envelope,
            Err(err) => {
                let ErrorKind::HttpClient { source } = err.kind() else {
                    return Err(err);
                };
                if source.is_transient() {
                    return Err(err!(ApiError::UpstreamUnavailable {
                        endpoint: LOGIN_PATH,
                        source: err.clone(),
                    }));
                }
                if let crate::http::HttpClientError::BadResponseStatusCode { status, body } = source
                {
                    if status.is_client_error() {
                        return Ok(LoginOutcome::Rejected {
                            message: format!("HTTP {status}: {body}"),
                        });
                    }
                }
                return Err(err);
            }
        };

        if !envelope.is_success() {
            return Ok(LoginOutcome::Rejected {
                message: envelope.msg().to_owned(),
            });
        }

        let data: LoginData = serde_json::from_value(envelope.data).map_err(|source| {
            err!(crate::http::HttpClientError::UnexpectedResponseJsonShape { source })
        })?;

        let Some(token) = data.token.filter(|token| !token.trim().is_empty()) else {
            return Ok(LoginOutcome::Rejected {
                message: "The login response doesn't contain a token".to_owned(),
            });
        };

        Ok(LoginOutcome::Granted {
            token: Token::new(token),
            expires_in: data.expires_in.map(Duration::from_secs),
        })
    }

    /// Signed anew on every attempt
    async fn post_code(&self, code: &str) -> Result<Envelope> {
        let login = &self.config.login;

        let request = LoginRequest {
            user_name: &login.username,
            pwd: &login.password,
            v_code: code,
            language: "zh",
        };

        let body = signing::sign(&request, &self.config.signing)?;

        self.http
            .post(login.url.trim())
            .timeout(self.config.timeouts.interactive)
            .header("Domainurl", &self.base_url)
            .json(&body)
            .read_json::<Envelope>()
            .await
    }
}

#[async_trait]
impl Authenticator for LoginClient {
    async fn login(&self) -> Result<LoginOutcome> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;

        let mut last_rejection = "No TOTP windows are configured".to_owned();

        for (offset, code) in self.totp_codes(now) {
            match self.try_code(&code).await? {
                granted @ LoginOutcome::Granted { .. } => {
                    info!(offset, "Login succeeded");
                    return Ok(granted);
                }
                LoginOutcome::Rejected { message } => {
                    warn!(offset, %message, "Login attempt was rejected");
                    last_rejection = message;
                }
            }
        }

        Ok(LoginOutcome::Rejected {
            message: last_rejection,
        })
    }
}

fn create_totp(secret: &str) -> Result<TOTP> {
    // Authenticator apps display the secret in lowercase groups with padding
    let normalized: String = secret
        .chars()
        .filter(|char| !char.is_whitespace() && *char != '=')
        .map(|char| char.to_ascii_uppercase())
        .collect();

    let bytes = Secret::Encoded(normalized).to_bytes().map_err(|err| {
        err!(crate::config::ConfigError::Invalid {
            message: format!("`api.login.totp_secret` is not valid base32: {err:?}"),
        })
    })?;

    Ok(TOTP::new_unchecked(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP,
        bytes,
    ))
}
