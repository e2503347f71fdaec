//! Failure taxonomy for a forwarding run.
//!
//! Every failure carries the sysexits-style code the invoking MTA expects,
//! plus the single line that ends up in the bounce (if any).

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Generic failure. The MTA treats it as temporary and may retry.
pub const EX_FAILURE: u8 = 1;
/// Data format error (sysexits.h). Used for oversized messages.
pub const EX_DATAERR: u8 = 65;
/// Addressee unknown (sysexits.h). The MTA bounces without retrying.
pub const EX_NOUSER: u8 = 67;
/// Configuration error (sysexits.h). The MTA defers the message.
pub const EX_CONFIG: u8 = 78;

pub const NO_RECIPIENT_MESSAGE: &str =
    "5.1.1 Bad destination mailbox address: No missed message email address.";
pub const TOO_LARGE_MESSAGE: &str = "4.3.4 Message too large";
pub const INTERNAL_ERROR_MESSAGE: &str =
    "Internal server error. Misconfiguration or the server dropped the connection.";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no destination mailbox given")]
    NoRecipient,

    #[error("message exceeds the {limit} byte limit")]
    MessageTooLarge { limit: u64 },

    #[error("failed to read message from stdin: {0}")]
    Input(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("receiver rejected the message: {msg}")]
    Rejected { msg: String },

    #[error("receiver answered HTTP {status}")]
    Remote { status: u16 },

    #[error("request to receiver failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ForwardError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ForwardError::NoRecipient | ForwardError::Rejected { .. } => EX_NOUSER,
            ForwardError::MessageTooLarge { .. } => EX_DATAERR,
            ForwardError::Config(_) => EX_CONFIG,
            ForwardError::Input(_) | ForwardError::Remote { .. } | ForwardError::Transport(_) => {
                EX_FAILURE
            }
        }
    }

    /// Line printed to stdout for the MTA to quote in the bounce.
    ///
    /// Configuration errors return `None`: they are a deployment problem and
    /// are reported through the log instead.
    pub fn bounce_message(&self) -> Option<String> {
        match self {
            ForwardError::NoRecipient => Some(NO_RECIPIENT_MESSAGE.to_string()),
            ForwardError::MessageTooLarge { .. } => Some(TOO_LARGE_MESSAGE.to_string()),
            ForwardError::Rejected { msg } => Some(single_line(msg)),
            ForwardError::Remote { .. } | ForwardError::Transport(_) => {
                Some(INTERNAL_ERROR_MESSAGE.to_string())
            }
            ForwardError::Input(e) => {
                Some(single_line(&format!("Failed to read message: {}", e)))
            }
            ForwardError::Config(_) => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ForwardError::Config(_))
    }
}

/// The MTA quotes exactly one line, so embedded line breaks are folded.
fn single_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
