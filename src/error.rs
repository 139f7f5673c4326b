//! Error taxonomy
//!
//! Per-attempt errors (`AttemptError`) drive the fallback chain and are never
//! handed to the caller directly. `ChatError` is the terminal outcome carried
//! by `CompletionResult::Failure`.

/// Why a single upstream attempt did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    /// Upstream answered with a non-2xx status
    #[error("API error {status}: {body}")]
    Http { status: u16, body: String },
    /// Connection failure, timeout, reset or an unreadable success body
    #[error("Transport error: {0}")]
    Transport(String),
}

impl AttemptError {
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        AttemptError::Transport(cause.to_string())
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AttemptError::Transport(format!("request timed out: {}", e))
        } else {
            AttemptError::Transport(e.to_string())
        }
    }
}

/// Terminal failure of a dispatch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("No API key configured")]
    AuthMissing,
    #[error("Transcript is empty")]
    EmptyTranscript,
    #[error("Request cancelled")]
    Cancelled,
    #[error("All {attempts} attempts failed; last error: {last}")]
    AllAttemptsFailed { attempts: usize, last: AttemptError },
    /// A stream frame that could not be parsed. Skipped by the decoder; quoted
    /// when a stream produced nothing but such frames.
    #[error("Malformed stream frame: {0}")]
    DecodeMalformed(String),
}

impl ChatError {
    /// Message shown to the user and recorded as the assistant turn
    pub fn user_message(&self) -> String {
        match self {
            ChatError::AuthMissing => {
                "Error: no API key configured. Set OPENROUTER_API_KEY or pass --api-key."
                    .to_string()
            }
            ChatError::EmptyTranscript => "Error: nothing to send.".to_string(),
            ChatError::Cancelled => "Request cancelled.".to_string(),
            ChatError::AllAttemptsFailed { last, .. } => match last {
                AttemptError::Http { status, body } => format!(
                    "Error: Unable to get a response (Status code: {}). Details: {}",
                    status, body
                ),
                AttemptError::Transport(_) => {
                    "Sorry, I encountered an error while processing your request. Please try again later."
                        .to_string()
                }
            },
            ChatError::DecodeMalformed(line) => format!("Error: malformed response: {}", line),
        }
    }
}
