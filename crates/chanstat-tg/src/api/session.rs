use crate::config::SessionConfig;
use crate::prelude::*;
use crate::{err, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Bearer token issued by the login endpoint
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Token(Arc<str>);

impl Token {
    pub(crate) fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Result of a single login attempt sequence
#[derive(Debug)]
pub(crate) enum LoginOutcome {
    Granted {
        token: Token,

        /// Lifetime declared by the server
        expires_in: Option<Duration>,
    },

    /// The server doesn't accept the credentials or none of the TOTP codes
    Rejected { message: String },
}

#[async_trait]
pub(crate) trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<LoginOutcome>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error("The API rejected the login credentials: {message}")]
    CredentialsInvalid { message: String },
}

#[derive(Debug, Clone)]
struct Session {
    access_token: Token,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,

    /// `expires_at` minus the safety margin
    refresh_at: DateTime<Utc>,
}

impl Session {
    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_at
    }
}

enum Slot {
    Empty,
    Active(Session),
    Rejected(Error),
}

#[derive(Debug, Clone)]
pub(crate) enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated { expires_at: DateTime<Utc> },
    Expired { expired_at: DateTime<Utc> },
    CredentialsRejected { message: String },
}

#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub(crate) state: SessionState,
    pub(crate) logins: u64,
    pub(crate) last_login_at: Option<DateTime<Utc>>,
}

/// Owns the access token. At most one login is in flight at a time, the
/// concurrent callers wait for it and reuse its result.
pub(crate) struct SessionManager {
    authenticator: Arc<dyn Authenticator>,
    config: SessionConfig,

    /// The lock is held for the whole duration of the login
    slot: tokio::sync::Mutex<Slot>,

    /// Mirror of the slot readable without waiting for an in-flight login
    snapshot: parking_lot::Mutex<SessionSnapshot>,

    rejected: tokio::sync::watch::Sender<Option<Error>>,
}

impl SessionManager {
    pub(crate) fn new(authenticator: Arc<dyn Authenticator>, config: SessionConfig) -> Self {
        Self {
            authenticator,
            config,
            slot: tokio::sync::Mutex::new(Slot::Empty),
            snapshot: parking_lot::Mutex::new(SessionSnapshot {
                state: SessionState::Unauthenticated,
                logins: 0,
                last_login_at: None,
            }),
            rejected: tokio::sync::watch::channel(None).0,
        }
    }

    pub(crate) async fn get_valid_token(&self) -> Result<Token> {
        let mut slot = self.slot.lock().await;

        match &*slot {
            Slot::Rejected(err) => return Err(err.clone()),
            Slot::Active(session) if session.is_usable(Utc::now()) => {
                return Ok(session.access_token.clone());
            }
            Slot::Active(_) | Slot::Empty => {}
        }

        let previous_state = self.snapshot().state;
        self.snapshot.lock().state = SessionState::Authenticating;

        let outcome = self
            .authenticator
            .login()
            .with_duration_log("Login attempt finished")
            .instrument(info_span!("login"))
            .await;

        let (token, expires_in) = match outcome {
            Ok(LoginOutcome::Granted { token, expires_in }) => (token, expires_in),
            Ok(LoginOutcome::Rejected { message }) => {
                metrics::increment_counter!("api_logins_total", "result" => "rejected");

                error!(%message, "The API rejected the credentials, no further logins will be attempted");

                let err = err!(SessionError::CredentialsInvalid {
                    message: message.clone()
                });
                *slot = Slot::Rejected(err.clone());
                self.snapshot.lock().state = SessionState::CredentialsRejected { message };
                self.rejected.send_replace(Some(err.clone()));
                return Err(err);
            }
            Err(err) => {
                metrics::increment_counter!("api_logins_total", "result" => "failed");
                self.snapshot.lock().state = previous_state;
                return Err(err);
            }
        };

        metrics::increment_counter!("api_logins_total", "result" => "granted");

        let session = self.new_session(token, expires_in);

        info!(
            expires_at = %session.expires_at,
            refresh_at = %session.refresh_at,
            "Logged in to the API"
        );

        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = SessionState::Authenticated {
                expires_at: session.expires_at,
            };
            snapshot.logins += 1;
            snapshot.last_login_at = Some(session.issued_at);
        }

        let token = session.access_token.clone();
        *slot = Slot::Active(session);

        Ok(token)
    }

    /// Forgets the session only if it still holds the `stale` token. This way
    /// many callers that saw the same rejected token cause only one re-login.
    pub(crate) async fn invalidate(&self, stale: &Token) {
        let mut slot = self.slot.lock().await;

        let Slot::Active(session) = &*slot else {
            return;
        };

        if session.access_token != *stale {
            debug!("The session was already refreshed, ignoring the invalidation");
            return;
        }

        info!("Invalidating the rejected session");

        *slot = Slot::Empty;
        self.snapshot.lock().state = SessionState::Unauthenticated;
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.snapshot.lock().clone();
        if let SessionState::Authenticated { expires_at } = snapshot.state {
            if expires_at <= Utc::now() {
                snapshot.state = SessionState::Expired {
                    expired_at: expires_at,
                };
            }
        }
        snapshot
    }

    /// Resolves once the credentials are rejected, which means that no API
    /// call can ever succeed.
    pub(crate) async fn credentials_rejected(&self) -> Error {
        let mut rejected = self.rejected.subscribe();
        loop {
            if let Some(err) = rejected.borrow_and_update().clone() {
                return err;
            }
            // The sender lives as long as `self`, so this can't fail
            if rejected.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    fn new_session(&self, access_token: Token, expires_in: Option<Duration>) -> Session {
        let ttl = expires_in.unwrap_or(self.config.default_ttl);

        let to_chrono = |duration: Duration| {
            chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
        };

        let issued_at = Utc::now();
        let expires_at = issued_at + to_chrono(ttl);
        let refresh_at = expires_at - to_chrono(self.config.safety_margin);

        Session {
            access_token,
            issued_at,
            expires_at,
            refresh_at,
        }
    }
}
