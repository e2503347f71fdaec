use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, info};
use reqwest::Url;

use crate::config::{self, ConfigError, Secret};
use crate::errors::ForwardError;
use crate::transport::{self, Submission, Transport};

/// Largest message accepted from the MTA, in bytes.
pub const MAX_ALLOWED_PAYLOAD: u64 = 25 * 1024 * 1024;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PATH: &str = "/api/internal/email_mirror_message";

/// Everything one forwarding run needs besides stdin and the network.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub recipient: String,
    pub secret_override: Option<Secret>,
    pub host: String,
    pub path: String,
    pub test_mode: bool,
    pub verify_ssl: bool,
    pub secrets_file: PathBuf,
    pub config_file: PathBuf,
}

/// `ORIGINAL_RECIPIENT` wins whenever it is present, even if empty or not
/// valid UTF-8 (converted lossily).
pub fn resolve_recipient(env_value: Option<OsString>, cli_value: &str) -> String {
    match env_value {
        Some(value) => value.to_string_lossy().into_owned(),
        None => cli_value.to_string(),
    }
}

/// Runs the pipeline for one message: validate, read, authenticate, send.
///
/// Every step is terminal on failure and nothing is retried; the caller turns
/// the error into the exit code the MTA acts on.
pub fn forward<R, T>(
    request: &ForwardRequest,
    input: R,
    transport: &T,
) -> Result<(), ForwardError>
where
    R: Read,
    T: Transport + ?Sized,
{
    if request.recipient.is_empty() {
        return Err(ForwardError::NoRecipient);
    }
    info!("[forward] forwarding message for rcpt={}", request.recipient);

    let message = read_bounded(input, MAX_ALLOWED_PAYLOAD)?;
    info!("[forward] read message from stdin ({} bytes)", message.len());

    let secret = resolve_secret(request)?;

    if request.test_mode {
        info!("[forward] test mode, not contacting {}", request.host);
        return Ok(());
    }

    let host = resolve_host(&request.host, &request.config_file)?;
    let verify_ssl = effective_verify_ssl(&host, request.verify_ssl);
    let url = target_url(&host, &request.path)?;

    let submission = Submission {
        url,
        form: build_form(&request.recipient, &message, &secret),
        verify_ssl,
    };

    info!("[forward] posting to {} (verify_ssl={})", submission.url, verify_ssl);
    let reply = transport.submit(&submission)?;
    transport::classify(&reply)?;
    info!("[forward] message accepted by receiver (HTTP {})", reply.status);
    Ok(())
}

/// Reads at most `limit + 1` bytes so an oversized message is detected
/// without ever buffering more than that.
pub fn read_bounded<R: Read>(input: R, limit: u64) -> Result<Vec<u8>, ForwardError> {
    let mut message = Vec::new();
    input.take(limit + 1).read_to_end(&mut message)?;
    if message.len() as u64 > limit {
        return Err(ForwardError::MessageTooLarge { limit });
    }
    Ok(message)
}

fn resolve_secret(request: &ForwardRequest) -> Result<Secret, ConfigError> {
    match &request.secret_override {
        Some(secret) => {
            debug!("[forward] using shared secret from command line");
            Ok(secret.clone())
        }
        None => config::load_shared_secret(&request.secrets_file),
    }
}

fn has_scheme(host: &str) -> bool {
    host.contains("://")
}

/// Prefixes a scheme when the host has none, based on `http_only`.
pub fn resolve_host(host: &str, config_file: &Path) -> Result<String, ConfigError> {
    if has_scheme(host) {
        return Ok(host.to_string());
    }
    let scheme = if config::load_http_only(config_file)? {
        "http://"
    } else {
        "https://"
    };
    debug!("[forward] host {} has no scheme, using {}", host, scheme);
    Ok(format!("{}{}", scheme, host))
}

/// Certificate checks are pointless against the default loopback host.
pub fn effective_verify_ssl(host: &str, requested: bool) -> bool {
    let bare = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');
    if bare == DEFAULT_HOST {
        return false;
    }
    requested
}

pub fn target_url(host: &str, path: &str) -> Result<Url, ConfigError> {
    Url::parse(host)
        .and_then(|base| base.join(path))
        .map_err(|e| ConfigError::InvalidUrl {
            url: host.to_string(),
            reason: e.to_string(),
        })
}

pub fn build_form(
    recipient: &str,
    message: &[u8],
    secret: &Secret,
) -> Vec<(&'static str, String)> {
    vec![
        ("rcpt_to", recipient.to_string()),
        ("msg_base64", STANDARD.encode(message)),
        ("secret", secret.expose().to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{EX_CONFIG, EX_DATAERR, EX_FAILURE, EX_NOUSER};
    use crate::transport::Reply;
    use std::cell::RefCell;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// Records every submission and answers with a scripted reply.
    struct MockTransport {
        reply: Reply,
        calls: RefCell<Vec<(Url, Vec<(&'static str, String)>, bool)>>,
    }

    impl MockTransport {
        fn answering(status: u16, body: &str) -> Self {
            Self {
                reply: Reply {
                    status,
                    body: body.to_string(),
                },
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }

        fn field(&self, name: &str) -> String {
            let calls = self.calls.borrow();
            let (_, form, _) = calls.last().expect("no submission recorded");
            form.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
                .unwrap()
        }
    }

    impl Transport for MockTransport {
        fn submit(&self, submission: &Submission) -> Result<Reply, ForwardError> {
            self.calls.borrow_mut().push((
                submission.url.clone(),
                submission.form.clone(),
                submission.verify_ssl,
            ));
            Ok(self.reply.clone())
        }
    }

    fn ini_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn request(recipient: &str) -> ForwardRequest {
        ForwardRequest {
            recipient: recipient.to_string(),
            secret_override: Some(Secret::new("s3cr3t")),
            host: DEFAULT_HOST.to_string(),
            path: DEFAULT_PATH.to_string(),
            test_mode: false,
            verify_ssl: true,
            secrets_file: PathBuf::from("/nonexistent/secrets.conf"),
            config_file: PathBuf::from("/nonexistent/email-mirror.conf"),
        }
    }

    #[test]
    fn env_recipient_takes_precedence() {
        assert_eq!(
            resolve_recipient(Some("env@example.com".into()), "cli@example.com"),
            "env@example.com"
        );
        assert_eq!(resolve_recipient(None, "cli@example.com"), "cli@example.com");
        assert_eq!(resolve_recipient(Some(OsString::new()), "cli@example.com"), "");
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_env_recipient_still_wins() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(b"m\xffirror@example.com".to_vec());
        let recipient = resolve_recipient(Some(raw), "cli@example.com");
        assert_eq!(recipient, "m\u{FFFD}irror@example.com");
    }

    #[test]
    fn empty_recipient_fails_without_network() {
        let transport = MockTransport::answering(200, "");
        let err = forward(&request(""), &b"Subject: hi\r\n\r\nbody"[..], &transport).unwrap_err();
        assert!(matches!(err, ForwardError::NoRecipient));
        assert_eq!(err.exit_code(), EX_NOUSER);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn message_at_limit_is_accepted() {
        let mut req = request("mirror@example.com");
        req.test_mode = true;
        let input = io::repeat(b'a').take(MAX_ALLOWED_PAYLOAD);
        let transport = MockTransport::answering(200, "");
        assert!(forward(&req, input, &transport).is_ok());
    }

    #[test]
    fn message_over_limit_is_rejected() {
        let transport = MockTransport::answering(200, "");
        let input = io::repeat(b'a').take(MAX_ALLOWED_PAYLOAD + 1);
        let err = forward(&request("mirror@example.com"), input, &transport).unwrap_err();
        assert!(matches!(err, ForwardError::MessageTooLarge { .. }));
        assert_eq!(err.exit_code(), EX_DATAERR);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn read_bounded_never_reads_past_limit_plus_one() {
        let mut source = io::repeat(b'x').take(100);
        let err = read_bounded(&mut source, 10).unwrap_err();
        assert!(matches!(err, ForwardError::MessageTooLarge { limit: 10 }));
        assert_eq!(source.limit(), 100 - 11);
    }

    #[test]
    fn test_mode_makes_no_network_call() {
        let secrets = ini_file("[secrets]\nshared_secret = from-file\n");
        let mut req = request("mirror@example.com");
        req.test_mode = true;
        req.secret_override = None;
        req.secrets_file = secrets.path().to_path_buf();

        let transport = MockTransport::answering(500, "");
        assert!(forward(&req, &b"hello"[..], &transport).is_ok());
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn missing_secret_store_is_fatal() {
        let mut req = request("mirror@example.com");
        req.secret_override = None;
        let transport = MockTransport::answering(200, "");
        let err = forward(&req, &b"hello"[..], &transport).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), EX_CONFIG);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn secret_from_store_is_sent() {
        let secrets = ini_file("[secrets]\nshared_secret = from-file\n");
        let mut req = request("mirror@example.com");
        req.secret_override = None;
        req.secrets_file = secrets.path().to_path_buf();

        let transport = MockTransport::answering(200, "");
        forward(&req, &b"hello"[..], &transport).unwrap();
        assert_eq!(transport.field("secret"), "from-file");
        assert_eq!(transport.field("rcpt_to"), "mirror@example.com");
    }

    #[test]
    fn loopback_host_disables_verification() {
        assert!(!effective_verify_ssl("https://127.0.0.1", true));
        assert!(!effective_verify_ssl("http://127.0.0.1/", true));
        assert!(!effective_verify_ssl("127.0.0.1", true));
        assert!(effective_verify_ssl("https://127.0.0.1:8443", true));
        assert!(effective_verify_ssl("https://mail.example.com", true));
        assert!(!effective_verify_ssl("https://mail.example.com", false));
    }

    #[test]
    fn scheme_follows_http_only_setting() {
        let plain = ini_file("[application_server]\nhttp_only = true\n");
        let host = resolve_host("example.com", plain.path()).unwrap();
        assert!(host.starts_with("http://"), "{}", host);

        let tls = ini_file("[application_server]\nhttp_only = false\n");
        let host = resolve_host("example.com", tls.path()).unwrap();
        assert!(host.starts_with("https://"), "{}", host);
    }

    #[test]
    fn explicit_scheme_skips_config() {
        let host = resolve_host("http://example.com", Path::new("/nonexistent")).unwrap();
        assert_eq!(host, "http://example.com");
    }

    #[test]
    fn target_url_joins_path() {
        let url = target_url("https://example.com", DEFAULT_PATH).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/internal/email_mirror_message");

        let err = target_url("https://", DEFAULT_PATH).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn default_host_posts_without_verification() {
        let transport = MockTransport::answering(200, "");
        forward(&request("mirror@example.com"), &b"hello"[..], &transport).unwrap();

        let calls = transport.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (url, _, verify_ssl) = &calls[0];
        assert_eq!(url.as_str(), "https://127.0.0.1/api/internal/email_mirror_message");
        assert!(!verify_ssl);
    }

    #[test]
    fn payload_round_trips_through_base64() {
        let message: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let transport = MockTransport::answering(200, "");
        forward(&request("mirror@example.com"), message.as_slice(), &transport).unwrap();

        let decoded = STANDARD.decode(transport.field("msg_base64")).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn bad_request_reports_server_message() {
        let transport =
            MockTransport::answering(400, r#"{"msg": "Invalid mirror email address."}"#);
        let err = forward(&request("bogus@example.com"), &b"hello"[..], &transport).unwrap_err();
        assert_eq!(err.exit_code(), EX_NOUSER);
        assert_eq!(
            err.bounce_message().as_deref(),
            Some("Invalid mirror email address.")
        );
    }

    #[test]
    fn server_error_is_generic_failure() {
        let transport = MockTransport::answering(500, "<html>oops</html>");
        let err = forward(&request("mirror@example.com"), &b"hello"[..], &transport).unwrap_err();
        assert_eq!(err.exit_code(), EX_FAILURE);
        assert_eq!(
            err.bounce_message().as_deref(),
            Some(crate::errors::INTERNAL_ERROR_MESSAGE)
        );
        assert_eq!(transport.call_count(), 1);
    }
}
