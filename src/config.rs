//! Read-only access to the two INI files the forwarder consults: the secrets
//! store and the deployment configuration.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use ini::{Ini, ParseOption};
use log::{debug, info};
use thiserror::Error;

pub const DEFAULT_SECRETS_FILE: &str = "/etc/email-mirror/secrets.conf";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/email-mirror/email-mirror.conf";

const SECRETS_SECTION: &str = "secrets";
const SHARED_SECRET_KEY: &str = "shared_secret";
const SERVER_SECTION: &str = "application_server";
const HTTP_ONLY_KEY: &str = "http_only";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot load {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("{}: missing [{section}] {key}", .path.display())]
    MissingKey {
        path: PathBuf,
        section: &'static str,
        key: &'static str,
    },

    #[error("{}: [{section}] {key} = {value:?} is not a boolean", .path.display())]
    InvalidBool {
        path: PathBuf,
        section: &'static str,
        key: &'static str,
        value: String,
    },

    #[error("invalid destination {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Shared secret for the ingestion API. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Loads `[secrets] shared_secret`. A missing file or key is an error.
pub fn load_shared_secret(path: &Path) -> Result<Secret, ConfigError> {
    debug!("[config] loading shared secret from {}", path.display());
    let conf = load_verbatim(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    match lookup(&conf, SECRETS_SECTION, SHARED_SECRET_KEY) {
        Some(value) if !value.is_empty() => Ok(Secret::new(value)),
        _ => Err(ConfigError::MissingKey {
            path: path.to_path_buf(),
            section: SECRETS_SECTION,
            key: SHARED_SECRET_KEY,
        }),
    }
}

/// Reads `[application_server] http_only`.
///
/// An absent file or key means plaintext is not allowed. A file that exists
/// but cannot be read or parsed is still an error.
pub fn load_http_only(path: &Path) -> Result<bool, ConfigError> {
    let conf = match load_verbatim(path) {
        Ok(conf) => conf,
        Err(ini::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            info!("[config] {} not found, assuming https", path.display());
            return Ok(false);
        }
        Err(source) => {
            return Err(ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let Some(value) = lookup(&conf, SERVER_SECTION, HTTP_ONLY_KEY) else {
        debug!("[config] no {} in {}, assuming false", HTTP_ONLY_KEY, path.display());
        return Ok(false);
    };

    parse_bool(value).ok_or_else(|| ConfigError::InvalidBool {
        path: path.to_path_buf(),
        section: SERVER_SECTION,
        key: HTTP_ONLY_KEY,
        value: value.to_string(),
    })
}

/// Values are taken literally: no quote stripping, no backslash escapes.
fn load_verbatim(path: &Path) -> Result<Ini, ini::Error> {
    let opt = ParseOption {
        enabled_quote: false,
        enabled_escape: false,
        ..Default::default()
    };
    Ini::load_from_file_opt(path, opt)
}

fn lookup<'a>(conf: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    conf.section(Some(section)).and_then(|props| props.get(key))
}

/// Accepts the usual INI spellings of a boolean.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}
