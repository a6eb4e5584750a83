//! Tether Agent
//!
//! Registers one service instance in etcd, keeps the registration alive
//! until Ctrl-C, then deregisters.

mod version;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tether_registry::{
    init_logging, Credentials, EtcdRegistry, LogConfig, RegisterOptions, Registry,
    RegistryConfig, TlsSettings,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(about = "Keep a service registration alive in etcd")]
#[command(version = version::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the service and hold the registration until interrupted
    Run(RunArgs),
    /// Print build information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Service name, used as the key prefix
    #[arg(long, env = "SERVICE_NAME")]
    service_name: String,

    /// Advertised host:port; an empty host is detected from local interfaces
    #[arg(long, env = "SERVICE_ADDR")]
    service_addr: Option<String>,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Lease TTL in seconds
    #[arg(long, env = "REGISTER_TTL", default_value_t = 30)]
    ttl: u64,

    /// Renewal interval in seconds (defaults to a third of the TTL)
    #[arg(long, env = "REGISTER_INTERVAL")]
    interval: Option<u64>,

    /// Per-operation timeout in seconds
    #[arg(long, env = "ETCD_TIMEOUT", default_value_t = 5)]
    timeout: u64,

    /// Connect over TLS using system roots
    #[arg(long, env = "ETCD_SECURE")]
    secure: bool,

    #[arg(long, env = "ETCD_CA_CERT")]
    ca_cert: Option<PathBuf>,

    #[arg(long, env = "ETCD_CLIENT_CERT", requires = "client_key")]
    client_cert: Option<PathBuf>,

    #[arg(long, env = "ETCD_CLIENT_KEY", requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// Server name to verify instead of the endpoint host
    #[arg(long, env = "ETCD_TLS_DOMAIN")]
    tls_domain: Option<String>,

    #[arg(long, env = "ETCD_USERNAME", requires = "password")]
    username: Option<String>,

    #[arg(long, env = "ETCD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Node metadata as key=value, repeatable
    #[arg(long = "meta", value_parser = parse_meta)]
    metadata: Vec<(String, String)>,
}

impl RunArgs {
    fn registry_config(&self) -> RegistryConfig {
        let mut config = RegistryConfig::new(self.service_name.clone())
            .with_endpoints(self.etcd_endpoints.iter().cloned())
            .with_timeout(Duration::from_secs(self.timeout));

        if let Some(addr) = &self.service_addr {
            config = config.with_service_addr(addr.clone());
        }

        for (key, value) in &self.metadata {
            config = config.with_metadata(key.clone(), value.clone());
        }

        if self.ca_cert.is_some() || self.client_cert.is_some() || self.tls_domain.is_some() {
            config = config.with_tls(TlsSettings {
                ca_cert: self.ca_cert.clone(),
                client_cert: self.client_cert.clone(),
                client_key: self.client_key.clone(),
                domain: self.tls_domain.clone(),
            });
        }
        config.secure = self.secure;

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config = config.with_credentials(Credentials::new(username.clone(), password.clone()));
        }

        config
    }

    fn register_options(&self) -> RegisterOptions {
        let options = RegisterOptions::new().with_ttl(Duration::from_secs(self.ttl));
        match self.interval {
            Some(secs) => options.with_interval(Duration::from_secs(secs)),
            None => options,
        }
    }
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info());
            Ok(())
        }
        Commands::Run(args) => run_agent(args).await,
    }
}

async fn run_agent(args: RunArgs) -> anyhow::Result<()> {
    let logging = init_logging(LogConfig::from_env())?;

    info!(version = %version::full_version(), "Starting tether-agent");

    let registry = EtcdRegistry::connect(args.registry_config())
        .await
        .context("failed to create registry")?;

    registry
        .register(args.register_options())
        .await
        .context("initial registration failed")?;

    let timeout = registry.config().timeout;
    match registry.store().get(registry.key(), timeout).await {
        Ok(Some(value)) => info!(key = %registry.key(), value = %value, "Registration visible in etcd"),
        Ok(None) => warn!(key = %registry.key(), "Registration not visible in etcd yet"),
        Err(e) => warn!(key = %registry.key(), error = %e, "Could not read back registration"),
    }

    println!("{}", serde_json::to_string(registry.node())?);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let result = registry.deregister().await;
    logging.shutdown();
    result.context("deregistration failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta() {
        assert_eq!(
            parse_meta("zone=us-east-1a"),
            Ok(("zone".to_string(), "us-east-1a".to_string()))
        );
        assert_eq!(
            parse_meta("url=http://x?a=b"),
            Ok(("url".to_string(), "http://x?a=b".to_string()))
        );
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=value").is_err());
    }

    #[test]
    fn test_cli_builds_config() {
        let cli = Cli::try_parse_from([
            "tether-agent",
            "run",
            "--service-name",
            "billing",
            "--service-addr",
            ":8080",
            "--etcd-endpoints",
            "10.0.0.1,10.0.0.2:2380",
            "--ttl",
            "9",
            "--interval",
            "1",
            "--meta",
            "zone=a",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.registry_config().validate().unwrap();
        assert_eq!(config.service_name, "billing");
        assert_eq!(config.service_addr, ":8080");
        assert_eq!(config.endpoints, vec!["10.0.0.1:2379", "10.0.0.2:2380"]);
        assert_eq!(config.metadata.get("zone").map(String::as_str), Some("a"));
        assert!(config.tls.is_none());

        let resolved = args.register_options().resolve();
        assert_eq!(resolved.ttl, Duration::from_secs(9));
        assert_eq!(resolved.interval, Duration::from_secs(3));
    }

    #[test]
    fn test_secure_flag_enables_tls() {
        let cli = Cli::try_parse_from([
            "tether-agent",
            "run",
            "--service-name",
            "billing",
            "--secure",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.registry_config().validate().unwrap().tls.is_some());
    }
}
