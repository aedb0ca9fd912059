//! Rule controller
//!
//! Keeps the routing table and the shared webhook configuration in step with
//! the set of Rules. A finalizer holds each Rule until its webhook entry and
//! handler are gone, so deletions are never missed across restarts.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event};
use kube::{Api, Client, ResourceExt};
use mirage_common::crd::{Rule, RulePhase, RuleStatus};
use mirage_common::kube_utils::patch_cluster_resource_status;
use tracing::{debug, info, warn};

use crate::config_sync::WebhookConfigSynchronizer;
use crate::error::WebhookError;
use crate::handler::RuleHandler;
use crate::routing::RoutingTable;

/// Finalizer guarding Rule cleanup
pub const RULE_FINALIZER: &str = "mirage.dev/rule-cleanup";

/// Periodic resync, restores webhook entries edited out of band
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared context for the Rule controller
pub struct RuleContext {
    /// Kubernetes client
    pub client: Client,
    /// Handlers served by the admission listener
    pub routes: Arc<RoutingTable>,
    /// Writer of the shared webhook configuration
    pub webhooks: Arc<WebhookConfigSynchronizer>,
}

/// Reconcile a Rule
pub async fn reconcile(rule: Arc<Rule>, ctx: Arc<RuleContext>) -> Result<Action, WebhookError> {
    let rules: Api<Rule> = Api::all(ctx.client.clone());

    finalizer(&rules, RULE_FINALIZER, rule, |event| async move {
        match event {
            Event::Apply(rule) => apply(&rule, &ctx).await,
            Event::Cleanup(rule) => cleanup(&rule, &ctx).await,
        }
    })
    .await
    .map_err(|e| WebhookError::Finalizer(Box::new(e)))
}

/// Check the Rule spec, naming the Rule in the error
pub fn validate_rule(rule: &Rule) -> Result<(), WebhookError> {
    rule.spec.validate().map_err(|message| WebhookError::InvalidRule {
        rule: rule.name_any(),
        message,
    })
}

/// Status a Rule should carry after reconciliation
pub fn desired_status(rule: &Rule, validation: &Result<(), WebhookError>) -> RuleStatus {
    match validation {
        Ok(()) => {
            let warnings = rule.spec.warnings();
            RuleStatus {
                phase: RulePhase::Ready,
                message: (!warnings.is_empty()).then(|| warnings.join("; ")),
                observed_generation: rule.metadata.generation,
            }
        }
        Err(e) => RuleStatus {
            phase: RulePhase::Invalid,
            message: Some(e.to_string()),
            observed_generation: rule.metadata.generation,
        },
    }
}

async fn apply(rule: &Rule, ctx: &RuleContext) -> Result<Action, WebhookError> {
    let name = rule.name_any();
    let validation = validate_rule(rule);

    match &validation {
        Ok(()) => {
            debug!(rule = %name, "Installing rule handler");
            ctx.routes.upsert(name.clone(), RuleHandler::new(name.as_str(), &rule.spec));
            ctx.webhooks.upsert(&name, &rule.spec).await?;
        }
        Err(e) => {
            warn!(rule = %name, error = %e, "Rule is invalid, withdrawing its webhook");
            ctx.webhooks.remove(&name).await?;
            ctx.routes.remove(&name);
        }
    }

    let status = desired_status(rule, &validation);
    if rule.status.as_ref() != Some(&status) {
        info!(rule = %name, phase = %status.phase, "Updating rule status");
        patch_cluster_resource_status::<Rule>(&ctx.client, &name, &status).await?;
    }

    match validation {
        Ok(()) => Ok(Action::requeue(RESYNC_INTERVAL)),
        Err(_) => Ok(Action::await_change()),
    }
}

async fn cleanup(rule: &Rule, ctx: &RuleContext) -> Result<Action, WebhookError> {
    let name = rule.name_any();
    info!(rule = %name, "Removing rule webhook and handler");

    // Webhook entry first, so the API server stops calling before the handler goes
    ctx.webhooks.remove(&name).await?;
    ctx.routes.remove(&name);

    Ok(Action::await_change())
}

/// Error policy for the Rule controller
pub fn error_policy(rule: Arc<Rule>, error: &WebhookError, _ctx: Arc<RuleContext>) -> Action {
    warn!(
        rule = %rule.name_any(),
        error = %error,
        "Rule reconciliation error, will retry"
    );
    Action::requeue(Duration::from_secs(30))
}
