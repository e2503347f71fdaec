mod config;
mod errors;
mod forward;
mod transport;

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info};

use config::Secret;
use forward::{ForwardRequest, DEFAULT_HOST, DEFAULT_PATH};
use transport::HttpTransport;

/// Forwards one message from the MTA on stdin to the email mirror API.
#[derive(Parser, Debug)]
#[command(name = "email-mirror", author, version, about, long_about = None)]
struct Args {
    /// Destination mailbox (ORIGINAL_RECIPIENT takes precedence when set)
    #[arg(short = 'r', long, default_value = "")]
    recipient: String,

    /// Shared secret, overriding the secrets file
    #[arg(short = 's', long = "shared-secret", default_value = "")]
    shared_secret: String,

    /// Destination host, with or without a scheme
    #[arg(short = 'd', long = "dst-host", default_value = DEFAULT_HOST)]
    dst_host: String,

    /// Endpoint path on the destination host
    #[arg(short = 'u', long = "dst-url", default_value = DEFAULT_PATH)]
    dst_url: String,

    /// Do not verify the server certificate
    #[arg(short = 'n', long = "not-verify-ssl")]
    not_verify_ssl: bool,

    /// Validate arguments and configuration only; send nothing
    #[arg(short = 't', long = "test")]
    test: bool,

    /// INI file holding [secrets] shared_secret
    #[arg(long, env = "EMAIL_MIRROR_SECRETS_FILE", default_value = config::DEFAULT_SECRETS_FILE)]
    secrets_file: PathBuf,

    /// INI file holding [application_server] http_only
    #[arg(long, env = "EMAIL_MIRROR_CONFIG_FILE", default_value = config::DEFAULT_CONFIG_FILE)]
    config_file: PathBuf,

    /// HTTP timeout in seconds
    #[arg(long, env = "EMAIL_MIRROR_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl Args {
    fn into_request(self, recipient: String) -> ForwardRequest {
        let secret_override = if self.shared_secret.is_empty() {
            None
        } else {
            Some(Secret::new(self.shared_secret))
        };
        ForwardRequest {
            recipient,
            secret_override,
            host: self.dst_host,
            path: self.dst_url,
            test_mode: self.test,
            verify_ssl: !self.not_verify_ssl,
            secrets_file: self.secrets_file,
            config_file: self.config_file,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // stdout carries the bounce line, so logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .init();

    let recipient =
        forward::resolve_recipient(env::var_os("ORIGINAL_RECIPIENT"), &args.recipient);
    let transport = HttpTransport::new(Duration::from_secs(args.timeout));
    let request = args.into_request(recipient);
    debug!("[main] {:?}", request);

    match forward::forward(&request, io::stdin().lock(), &transport) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_fatal() {
                error!("[main] {}", e);
            } else {
                info!("[main] {}", e);
            }
            if let Some(line) = e.bounce_message() {
                println!("{}", line);
            }
            ExitCode::from(e.exit_code())
        }
    }
}
