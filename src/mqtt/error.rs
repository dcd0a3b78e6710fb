//! Error definitions for the subscriber session

use thiserror::Error;

/// Fatal session errors. Everything here ends the process with status 1.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport to the broker could not be established.
    #[error("could not connect to broker: {0}")]
    Connect(String),

    /// The broker answered CONNECT with a non-zero return code.
    #[error("broker rejected the connection with code {code}")]
    BrokerRejected { code: u8 },

    /// The subscribe request could not be queued on the client.
    #[error("failed to subscribe to {filter}: {source}")]
    Subscribe {
        filter: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

impl SessionError {
    pub fn is_authorization_failure(&self) -> bool {
        matches!(self, SessionError::BrokerRejected { code } if is_authorization_code(*code))
    }
}

/// CONNACK return codes 4 (bad username or password) and 5 (not authorized).
pub fn is_authorization_code(code: u8) -> bool {
    matches!(code, 4 | 5)
}

/// Failure while turning one payload into printable output. Always recovered
/// by the message handler.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("failed to render JSON: {0}")]
    Render(#[from] serde_json::Error),
}
