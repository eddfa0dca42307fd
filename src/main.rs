use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use mailsink::Server;
use mailsink_utils::{load_config, Config, Credentials};
use tracing::info;

/// Disposable SMTP capture sink with an HTTP API.
///
/// Every message delivered over SMTP is kept in memory, never relayed, and
/// can be listed, downloaded or deleted over HTTP.
#[derive(Parser, Debug)]
#[command(name = "mailsink", version, about)]
struct Cli {
    /// TOML configuration file, command line flags take precedence
    #[arg(short, long, env = "MAILSINK_CONFIG")]
    config: Option<PathBuf>,

    /// SMTP port to listen on
    #[arg(short = 's', long, env = "MAILSINK_SMTP_PORT")]
    smtp_port: Option<u16>,

    /// IP address to bind the SMTP listener to
    #[arg(long, env = "MAILSINK_SMTP_IP")]
    smtp_ip: Option<String>,

    /// HTTP port to listen on
    #[arg(long, env = "MAILSINK_HTTP_PORT")]
    http_port: Option<u16>,

    /// IP address to bind the HTTP listener to
    #[arg(long, env = "MAILSINK_HTTP_IP")]
    http_ip: Option<String>,

    /// Host name announced to SMTP clients
    #[arg(long, env = "MAILSINK_HOSTNAME")]
    hostname: Option<String>,

    /// Comma separated list of sender addresses allowed to deliver
    #[arg(short, long, value_delimiter = ',', env = "MAILSINK_WHITELIST")]
    whitelist: Vec<String>,

    /// Maximum number of messages kept in memory
    #[arg(short, long, env = "MAILSINK_MAX")]
    max: Option<NonZeroUsize>,

    /// HTTP basic auth credentials, USERNAME:PASSWORD
    #[arg(short, long, env = "MAILSINK_AUTH")]
    auth: Option<Credentials>,

    /// Include the raw header mapping in listed messages
    #[arg(long)]
    headers: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "MAILSINK_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(port) = self.smtp_port {
            config.smtp.port = port;
        }
        if let Some(ip) = self.smtp_ip {
            config.smtp.host = ip;
        }
        if let Some(port) = self.http_port {
            config.http.port = port;
        }
        if let Some(ip) = self.http_ip {
            config.http.host = ip;
        }
        if let Some(hostname) = self.hostname {
            config.smtp.hostname = hostname;
        }
        if !self.whitelist.is_empty() {
            config.smtp.whitelist = self.whitelist;
        }
        if let Some(max) = self.max {
            config.store.max_messages = max;
        }
        if self.auth.is_some() {
            config.http.auth = self.auth;
        }
        if self.headers {
            config.store.headers = true;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok(config)
    }
}

/// Sets up tracing on stderr, `RUST_LOG` wins over the configured level.
fn setup_logging(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;
    setup_logging(&config.log_level);

    info!(
        smtp = %config.smtp.bind_addr(),
        http = %config.http.bind_addr(),
        max_messages = config.store.max_messages.get(),
        auth = config.http.auth.is_some(),
        "Starting Mailsink"
    );
    Server::new(&config).run().await
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_defaults_without_flags() {
        let config = Cli::try_parse_from(["mailsink"])
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.smtp.bind_addr(), "0.0.0.0:1025");
        assert_eq!(config.http.bind_addr(), "0.0.0.0:1080");
        assert_eq!(config.store.max_messages.get(), 100);
        assert!(config.smtp.whitelist.is_empty());
        assert!(config.http.auth.is_none());
        assert!(!config.store.headers);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Cli::try_parse_from([
            "mailsink",
            "-s",
            "2525",
            "--http-port",
            "8080",
            "--http-ip",
            "127.0.0.1",
            "-w",
            "a@x.com,b@x.com",
            "-m",
            "5",
            "-a",
            "admin:secret",
            "--headers",
        ])
        .unwrap()
        .into_config()
        .unwrap();

        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.http.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.smtp.whitelist, ["a@x.com", "b@x.com"]);
        assert_eq!(config.store.max_messages.get(), 5);
        assert_eq!(config.http.auth.unwrap().username, "admin");
        assert!(config.store.headers);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[smtp]\nport = 2600\nhostname = \"file.test\"\n[store]\nmax_messages = 7"
        )
        .unwrap();

        let config = Cli::try_parse_from([
            "mailsink",
            "--config",
            file.path().to_str().unwrap(),
            "--smtp-port",
            "2700",
        ])
        .unwrap()
        .into_config()
        .unwrap();

        assert_eq!(config.smtp.port, 2700);
        assert_eq!(config.smtp.hostname, "file.test");
        assert_eq!(config.store.max_messages.get(), 7);
    }

    #[test]
    fn test_invalid_flags_are_rejected() {
        assert!(Cli::try_parse_from(["mailsink", "-m", "0"]).is_err());
        assert!(Cli::try_parse_from(["mailsink", "-a", "nocolon"]).is_err());
        assert!(Cli::try_parse_from(["mailsink", "-s", "notaport"]).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let result = Cli::try_parse_from(["mailsink", "-c", "/nonexistent/mailsink.toml"])
            .unwrap()
            .into_config();
        assert!(result.is_err());
    }
}
