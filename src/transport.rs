//! HTTP submission to the receiving application.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Url;
use serde::Deserialize;

use crate::errors::ForwardError;

const USER_AGENT: &str = concat!("email-mirror/", env!("CARGO_PKG_VERSION"));

/// One form-encoded POST. Holds the secret, so it is deliberately not `Debug`.
pub struct Submission {
    pub url: Url,
    pub form: Vec<(&'static str, String)>,
    pub verify_ssl: bool,
}

/// Final status of the POST, with the body kept only for error statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

pub trait Transport {
    fn submit(&self, submission: &Submission) -> Result<Reply, ForwardError>;
}

/// Blocking reqwest client. Proxies are never consulted.
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Transport for HttpTransport {
    fn submit(&self, submission: &Submission) -> Result<Reply, ForwardError> {
        if !submission.verify_ssl {
            debug!("[transport] certificate verification disabled for {}", submission.url);
        }

        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .user_agent(USER_AGENT)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!submission.verify_ssl)
            .build()?;

        let response = client
            .post(submission.url.clone())
            .form(&submission.form)
            .send()?;

        let status = response.status();
        debug!("[transport] {} answered {}", submission.url, status);

        let body = if status.is_client_error() || status.is_server_error() {
            response.text().unwrap_or_else(|e| {
                warn!("[transport] could not read error body: {}", e);
                String::new()
            })
        } else {
            String::new()
        };

        Ok(Reply {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    msg: String,
}

/// Maps the receiver's answer onto the forwarding outcome.
pub fn classify(reply: &Reply) -> Result<(), ForwardError> {
    match reply.status {
        s if s < 400 => Ok(()),
        400 => Err(ForwardError::Rejected {
            msg: rejection_message(&reply.body),
        }),
        status => Err(ForwardError::Remote { status }),
    }
}

fn rejection_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.msg,
        Err(e) => {
            warn!("[transport] 400 body is not the expected JSON: {}", e);
            let raw = body.trim();
            if raw.is_empty() {
                "Bad request".to_string()
            } else {
                raw.to_string()
            }
        }
    }
}
