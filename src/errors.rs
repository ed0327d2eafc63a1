use std::fmt;

use thiserror::Error;

pub type RestResult<T> = std::result::Result<T, RestError>;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("server error {status}: {message} (code: {code})")]
    Server {
        status: u16,
        code: i64,
        message: String,
    },
    #[error("invalid config: {field}: {why}")]
    InvalidConfig {
        field: &'static str,
        why: &'static str,
    },
    #[error("signing error: {0}")]
    Signing(String),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl RestError {
    pub fn with_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        match serde_json::from_str::<ServerErr>(body) {
            Ok(err) => RestError::Server {
                status: status.as_u16(),
                code: err.code,
                message: err.msg,
            },
            Err(_) => RestError::Http {
                status: status.as_u16(),
                body: body.to_string(),
            },
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ServerErr {
    code: i64,
    msg: String,
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to dial user data stream: {0}")]
    Dial(String),
    #[error("failed to read frame: {0}")]
    Read(String),
    #[error("invalid user data message: {0}")]
    Decode(String),
    #[error("user data stream closed by peer")]
    Closed,
    #[error("read deadline expired")]
    DeadlineExpired,
    #[error("listen key expired")]
    SessionExpired,
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Recoverable fault recorded for diagnostic consumption.
#[derive(Debug, Error)]
pub enum ErrorNotice {
    #[error("account snapshot refresh failed: {0}")]
    SnapshotRefresh(#[source] RestError),
}

/// Every notice that was pending when the mirror was read.
#[derive(Debug)]
pub struct PendingErrors(Vec<ErrorNotice>);

impl PendingErrors {
    pub(crate) fn from_notices(notices: Vec<ErrorNotice>) -> Option<Self> {
        if notices.is_empty() {
            None
        } else {
            Some(Self(notices))
        }
    }

    pub fn notices(&self) -> &[ErrorNotice] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<ErrorNotice> {
        self.0
    }
}

impl fmt::Display for PendingErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, notice) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{notice}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PendingErrors {}
