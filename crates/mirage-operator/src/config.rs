//! Operator configuration
//!
//! Parsed once at startup from flags and environment, then handed to each
//! component.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser};
use mirage_webhook::config_sync::WebhookTemplate;

/// mirage - image mutation and mirroring operator
#[derive(Parser, Debug)]
#[command(name = "mirage-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    #[command(flatten)]
    pub config: OperatorConfig,
}

/// Runtime settings of the operator
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator runs in
    #[arg(long, env = "NAMESPACE", default_value = "mirage-system")]
    pub namespace: String,

    /// Service fronting the admission listener
    #[arg(long, env = "SERVICE_NAME", default_value = "mirage-operator")]
    pub service_name: String,

    /// Port of that service
    #[arg(long, env = "SERVICE_PORT", default_value_t = 443)]
    pub service_port: i32,

    /// Address the admission listener binds to
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9443")]
    pub listen_addr: SocketAddr,

    /// TLS certificate of the admission listener
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/etc/mirage/tls/tls.crt")]
    pub tls_cert: PathBuf,

    /// TLS key of the admission listener
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/etc/mirage/tls/tls.key")]
    pub tls_key: PathBuf,

    /// CA bundle written into the webhook configuration
    #[arg(long, env = "CA_BUNDLE_FILE", default_value = "/etc/mirage/tls/ca.crt")]
    pub ca_bundle: PathBuf,

    /// Image running the pull and push phases of mirror Jobs
    #[arg(long, env = "MIRROR_EXECUTOR_IMAGE")]
    pub executor_image: Option<String>,

    /// How long finished Mirrors are kept, in seconds
    #[arg(long, env = "MIRROR_RETENTION", default_value = "3600", value_parser = parse_seconds)]
    pub retention: Duration,

    /// How often finished Mirrors are looked for, in seconds
    #[arg(long, env = "CLEANUP_INTERVAL", default_value = "60", value_parser = parse_seconds)]
    pub cleanup_interval: Duration,

    /// Never send pods of the operator namespace to the webhook
    #[arg(
        long,
        env = "EXCLUDE_OPERATOR_NAMESPACE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub exclude_operator_namespace: bool,

    /// Budget for resolving a pod's image platforms, in seconds
    #[arg(long, env = "REGISTRY_TIMEOUT", default_value = "5", value_parser = parse_seconds)]
    pub registry_timeout: Duration,
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("expected whole seconds: {e}"))
}

impl OperatorConfig {
    /// The executor image, which mirroring cannot run without
    pub fn executor_image(&self) -> anyhow::Result<&str> {
        self.executor_image
            .as_deref()
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("mirror executor image is not set (--executor-image / MIRROR_EXECUTOR_IMAGE)")
            })
    }

    /// Template for the webhook entries of every Rule
    pub fn webhook_template(&self, ca_bundle: Vec<u8>) -> WebhookTemplate {
        WebhookTemplate {
            service_name: self.service_name.clone(),
            service_namespace: self.namespace.clone(),
            service_port: self.service_port,
            ca_bundle,
            exclude_namespace: self
                .exclude_operator_namespace
                .then(|| self.namespace.clone()),
        }
    }
}
