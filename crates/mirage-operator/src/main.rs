//! mirage operator - pod image rewriting and registry mirroring

mod config;
mod controller_runner;

use std::sync::Arc;

use anyhow::Context as _;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirage_common::crd::{Mirror, Rule};
use mirage_common::retry::{retry_with_backoff, RetryConfig};
use mirage_common::FIELD_MANAGER;
use mirage_image::{AffinityBuilder, PlatformResolver, RegistryManifestSource};
use mirage_mirror::MirrorContext;
use mirage_webhook::config_sync::{KubeWebhookConfigStore, WebhookConfigSynchronizer};
use mirage_webhook::controller::RuleContext;
use mirage_webhook::{webhook_router, RoutingTable, WebhookState};

use crate::config::{Cli, OperatorConfig};

/// Attempts at installing each CRD before startup fails
const CRD_INSTALL_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The admission listener cannot serve TLS without a crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let rule = serde_yaml::to_string(&Rule::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Rule CRD: {}", e))?;
        let mirror = serde_yaml::to_string(&Mirror::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Mirror CRD: {}", e))?;
        println!("{rule}---\n{mirror}");
        return Ok(());
    }

    run(cli.config).await
}

/// Install or update both CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Rule::crd(), Mirror::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        let retry = RetryConfig::with_max_attempts(CRD_INSTALL_ATTEMPTS);
        let (crds, params, crd, crd_name) = (&crds, &params, &crd, name.as_str());
        retry_with_backoff(&retry, "install CRD", || async move {
            crds.patch(crd_name, params, &Patch::Apply(crd)).await
        })
        .await
        .with_context(|| format!("Failed to install CRD {name}"))?;
    }

    tracing::info!("All mirage CRDs installed/updated");
    Ok(())
}

async fn run(config: OperatorConfig) -> anyhow::Result<()> {
    let executor_image = config.executor_image()?.to_string();

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    ensure_crds_installed(&client).await?;

    let ca_bundle = tokio::fs::read(&config.ca_bundle)
        .await
        .with_context(|| format!("Failed to read CA bundle {}", config.ca_bundle.display()))?;
    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS material {} / {}",
                config.tls_cert.display(),
                config.tls_key.display()
            )
        })?;

    let routes = Arc::new(RoutingTable::new());
    let resolver = Arc::new(PlatformResolver::new(Arc::new(RegistryManifestSource::new())));
    let state = Arc::new(WebhookState {
        routes: routes.clone(),
        affinity: Arc::new(AffinityBuilder::with_timeout(resolver, config.registry_timeout)),
    });

    let webhooks = Arc::new(WebhookConfigSynchronizer::new(
        Arc::new(KubeWebhookConfigStore::new(client.clone())),
        config.webhook_template(ca_bundle),
    ));
    let rule_ctx = Arc::new(RuleContext {
        client: client.clone(),
        routes,
        webhooks,
    });
    let mirror_ctx = Arc::new(MirrorContext::new(client.clone(), executor_image));

    tracing::info!("Starting controllers...");
    let rule_controller = controller_runner::build_rule_controller(rule_ctx);
    let mirror_controller = controller_runner::build_mirror_controller(mirror_ctx);
    let mirror_cleanup =
        controller_runner::build_mirror_cleanup(client, config.cleanup_interval, config.retention);

    tracing::info!(addr = %config.listen_addr, "Starting admission server");
    let server = axum_server::bind_rustls(config.listen_addr, tls_config)
        .serve(webhook_router(state).into_make_service());

    tokio::select! {
        result = server => {
            result.context("Admission server failed")?;
        }
        _ = rule_controller => {
            tracing::info!("Rule controller stopped, shutting down");
        }
        _ = mirror_controller => {
            anyhow::bail!("Mirror controller exited unexpectedly");
        }
        _ = mirror_cleanup => {
            anyhow::bail!("Mirror cleanup exited unexpectedly");
        }
    }

    Ok(())
}
