mod ext;
mod macros;

use crate::api::{ApiError, SessionError, SigningError};
use crate::prelude::*;
use crate::util::DynError;
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing_error::SpanTrace;

pub(crate) use ext::*;
pub(crate) use macros::*;

pub(crate) mod prelude {
    pub(crate) use super::ext::ResultExt as _;
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Describes any possible error that may happen in the application lifetime.
#[derive(Clone)]
pub struct Error {
    imp: Arc<ErrorImp>,
}

struct ErrorImp {
    /// Small identifier used for debugging purposes.
    /// It is mentioned in the chat when the error happens.
    /// This way we as developers can copy it and lookup the logs using this id.
    id: String,
    kind: ErrorKind,

    // Participates only in debug impl
    spantrace: SpanTrace,
}

#[derive(Error, Debug)]
pub(crate) enum ErrorKind {
    #[error(transparent)]
    Signing {
        #[from]
        source: SigningError,
    },

    #[error(transparent)]
    Session {
        #[from]
        source: SessionError,
    },

    #[error(transparent)]
    Api {
        #[from]
        source: ApiError,
    },

    #[error(transparent)]
    HttpClient {
        #[from]
        source: crate::http::HttpClientError,
    },

    #[error(transparent)]
    Config {
        #[from]
        source: crate::config::ConfigError,
    },

    #[error(transparent)]
    ConfigEdit {
        #[from]
        source: crate::config::ConfigEditError,
    },

    #[error(transparent)]
    Sheets {
        #[from]
        source: crate::delivery::SheetsError,
    },

    #[error(transparent)]
    ReportCommand {
        #[from]
        source: crate::tg::ReportCommandError,
    },

    #[error(transparent)]
    Tg {
        #[from]
        source: teloxide::RequestError,
    },

    #[error(transparent)]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Multiple errors occurred:\n{}", errs.iter().map(|err| format!("- {err}")).join("\n"))]
    Multiple { errs: Vec<Error> },

    /// Unrecoverable kind of error, that is not supposed to happen, but when
    /// it happens we can't do anything reasonable about it, so no structural
    /// error handling is possible, this error is just propagated to the top.
    #[error("FATAL: {message}")]
    Fatal {
        message: String,
        source: Option<Box<DynError>>,
    },
}

impl Error {
    pub(crate) fn id(&self) -> &str {
        &self.imp.id
    }

    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.imp.kind
    }

    /// Errors caused by interaction with the user.
    /// These are most likely caused by humanz sending wrong input.
    pub(crate) fn is_user_error(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::ReportCommand { .. } | ErrorKind::ConfigEdit { .. } => true,
            ErrorKind::Multiple { errs } => errs.iter().all(Self::is_user_error),
            ErrorKind::Signing { .. }
            | ErrorKind::Session { .. }
            | ErrorKind::Api { .. }
            | ErrorKind::HttpClient { .. }
            | ErrorKind::Config { .. }
            | ErrorKind::Sheets { .. }
            | ErrorKind::Tg { .. }
            | ErrorKind::Io { .. }
            | ErrorKind::Fatal { .. } => false,
        }
    }

    /// The API identity was rejected. Nothing can succeed after this, so
    /// the process is expected to shut down.
    pub(crate) fn is_credentials_invalid(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::Session {
                source: SessionError::CredentialsInvalid { .. },
            } => true,
            ErrorKind::Multiple { errs } => errs.iter().any(Self::is_credentials_invalid),
            _ => false,
        }
    }

    /// The API rejected the token even after a re-login
    pub(crate) fn is_authentication(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::Api {
                source: ApiError::Authentication { .. },
            } => true,
            ErrorKind::Multiple { errs } => errs.iter().any(Self::is_authentication),
            _ => false,
        }
    }

    pub(crate) fn is_upstream_unavailable(&self) -> bool {
        matches!(
            &self.imp.kind,
            ErrorKind::Api {
                source: ApiError::UpstreamUnavailable { .. }
            }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error (id: {}): {}", self.imp.id, self.imp.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.imp.kind.source()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)?;
        fmt::Display::fmt(&self.imp.spantrace, f)
    }
}

impl<T: Into<ErrorKind>> From<T> for Error {
    #[track_caller]
    fn from(kind: T) -> Self {
        let imp = ErrorImp {
            kind: kind.into(),
            id: nanoid::nanoid!(6),
            spantrace: SpanTrace::capture(),
        };

        let err = Self { imp: Arc::new(imp) };

        trace!(err = tracing_err(&err), "Created an error");

        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_invalid_is_detected_inside_multiple() {
        let creds: Error = SessionError::CredentialsInvalid {
            message: "wrong password".to_owned(),
        }
        .into();
        let other = fatal!("unrelated");

        let multiple: Error = ErrorKind::Multiple {
            errs: vec![other.clone(), creds.clone()],
        }
        .into();

        assert!(creds.is_credentials_invalid());
        assert!(!other.is_credentials_invalid());
        assert!(multiple.is_credentials_invalid());
        assert!(!multiple.is_user_error());
    }

    #[test]
    fn display_mentions_id() {
        let err = fatal!("boom {}", 42);
        assert_eq!(err.to_string(), format!("Error (id: {}): FATAL: boom 42", err.id()));
    }
}
