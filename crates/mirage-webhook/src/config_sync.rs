//! Shared MutatingWebhookConfiguration sync
//!
//! All Rules share one `MutatingWebhookConfiguration`. Each Rule owns exactly
//! one entry in its `webhooks` list, keyed by [`webhook_entry_name`]. Writes
//! touch a single entry through JSON patch, never the whole object, and the
//! last entry's removal deletes the object.
//!
//! Patch computation ([`plan_upsert`], [`plan_remove`]) is pure. Index-based
//! operations carry a `test` op on the entry name so a concurrent writer that
//! shifted the list makes the patch fail (422) instead of clobbering the
//! wrong entry; the whole read-plan-write cycle is then retried.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::Client;
use mirage_common::crd::RuleSpec;
use mirage_common::kube_utils::is_not_found;
use mirage_common::retry::{retry_with_backoff_if, RetryConfig};
use mirage_common::{MANAGED_BY_LABEL, OPERATOR_NAME};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::admission::WEBHOOK_PATH_PREFIX;
use crate::error::WebhookError;

/// Name of the shared MutatingWebhookConfiguration
pub const WEBHOOK_CONFIG_NAME: &str = OPERATOR_NAME;

/// Admission timeout when the Rule does not set one
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 5;

/// Label carrying a namespace's own name
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Name of the webhook entry owned by `rule`
pub fn webhook_entry_name(rule: &str) -> String {
    format!("{rule}.{OPERATOR_NAME}.io")
}

/// Where the API server reaches the admission listener
#[derive(Clone, Debug)]
pub struct WebhookTemplate {
    /// Service fronting the admission listener
    pub service_name: String,
    /// Namespace of that service
    pub service_namespace: String,
    /// Service port
    pub service_port: i32,
    /// PEM bundle the API server uses to verify the listener
    pub ca_bundle: Vec<u8>,
    /// Namespace whose pods are never sent to the webhook
    pub exclude_namespace: Option<String>,
}

/// Drop empty selector parts, which the API server does not store
fn compact_selector(selector: LabelSelector) -> LabelSelector {
    LabelSelector {
        match_labels: selector.match_labels.filter(|labels| !labels.is_empty()),
        match_expressions: selector.match_expressions.filter(|exprs| !exprs.is_empty()),
    }
}

/// Build the webhook entry for a Rule.
///
/// Every field the API server would default is set explicitly, so an
/// entry read back from the server compares equal to a freshly built one.
pub fn build_webhook_entry(rule: &str, spec: &RuleSpec, template: &WebhookTemplate) -> MutatingWebhook {
    let mut namespace_selector = spec.namespace_selector.clone().unwrap_or_default();
    if let Some(ns) = &template.exclude_namespace {
        namespace_selector
            .match_expressions
            .get_or_insert_with(Vec::new)
            .push(LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "NotIn".to_string(),
                values: Some(vec![ns.clone()]),
            });
    }

    let overrides = spec.mutating_webhook.clone().unwrap_or_default();

    MutatingWebhook {
        name: webhook_entry_name(rule),
        admission_review_versions: vec!["v1".to_string()],
        client_config: WebhookClientConfig {
            ca_bundle: Some(ByteString(template.ca_bundle.clone())),
            service: Some(ServiceReference {
                name: template.service_name.clone(),
                namespace: template.service_namespace.clone(),
                path: Some(format!("{WEBHOOK_PATH_PREFIX}{rule}")),
                port: Some(template.service_port),
            }),
            url: None,
        },
        failure_policy: Some(overrides.failure_policy.unwrap_or_default().to_string()),
        side_effects: overrides.side_effects.unwrap_or_default().to_string(),
        timeout_seconds: Some(overrides.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)),
        match_policy: Some("Equivalent".to_string()),
        reinvocation_policy: Some("Never".to_string()),
        namespace_selector: Some(compact_selector(namespace_selector)),
        object_selector: Some(compact_selector(spec.pod_selector.clone().unwrap_or_default())),
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec![String::new()]),
            api_versions: Some(vec!["*".to_string()]),
            operations: Some(vec!["CREATE".to_string()]),
            resources: Some(vec!["pods".to_string()]),
            scope: Some("*".to_string()),
        }]),
        ..Default::default()
    }
}

/// Write needed to bring the shared configuration to a desired state
#[derive(Debug, PartialEq)]
pub enum ConfigChange {
    /// Create the configuration with the given contents
    Create(MutatingWebhookConfiguration),
    /// Apply a JSON patch to the configuration
    Patch(Vec<PatchOperation>),
    /// Delete the configuration, if it is still at this resource version
    Delete {
        /// Resource version the plan was computed against
        resource_version: Option<String>,
    },
    /// Nothing to do
    Unchanged,
}

fn entry_pointer(index: usize) -> PointerBuf {
    PointerBuf::from_tokens(["webhooks".to_string(), index.to_string()])
}

fn name_guard(index: usize, name: &str) -> PatchOperation {
    PatchOperation::Test(TestOperation {
        path: PointerBuf::from_tokens(["webhooks".to_string(), index.to_string(), "name".to_string()]),
        value: serde_json::Value::String(name.to_string()),
    })
}

fn entry_index(current: &MutatingWebhookConfiguration, name: &str) -> Option<usize> {
    current
        .webhooks
        .as_deref()
        .unwrap_or_default()
        .iter()
        .position(|w| w.name == name)
}

/// Plan the write that installs `entry` into `current`
pub fn plan_upsert(
    current: Option<&MutatingWebhookConfiguration>,
    entry: &MutatingWebhook,
) -> Result<ConfigChange, WebhookError> {
    let Some(current) = current else {
        return Ok(ConfigChange::Create(MutatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(WEBHOOK_CONFIG_NAME.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    OPERATOR_NAME.to_string(),
                )])),
                ..Default::default()
            },
            webhooks: Some(vec![entry.clone()]),
        }));
    };

    let value = serde_json::to_value(entry)?;

    match entry_index(current, &entry.name) {
        Some(index) => {
            let existing = &current.webhooks.as_deref().unwrap_or_default()[index];
            if existing == entry {
                return Ok(ConfigChange::Unchanged);
            }
            Ok(ConfigChange::Patch(vec![
                name_guard(index, &entry.name),
                PatchOperation::Replace(ReplaceOperation {
                    path: entry_pointer(index),
                    value,
                }),
            ]))
        }
        // A configuration stripped of its list needs the list created first
        None if current.webhooks.is_none() => Ok(ConfigChange::Patch(vec![PatchOperation::Add(
            AddOperation {
                path: PointerBuf::from_tokens(["webhooks"]),
                value: serde_json::Value::Array(vec![value]),
            },
        )])),
        None => Ok(ConfigChange::Patch(vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["webhooks", "-"]),
            value,
        })])),
    }
}

/// Plan the write that drops the entry named `name` from `current`
pub fn plan_remove(current: Option<&MutatingWebhookConfiguration>, name: &str) -> ConfigChange {
    let Some(current) = current else {
        return ConfigChange::Unchanged;
    };
    let Some(index) = entry_index(current, name) else {
        return ConfigChange::Unchanged;
    };

    if current.webhooks.as_ref().map_or(0, Vec::len) == 1 {
        return ConfigChange::Delete {
            resource_version: current.metadata.resource_version.clone(),
        };
    }

    ConfigChange::Patch(vec![
        name_guard(index, name),
        PatchOperation::Remove(RemoveOperation {
            path: entry_pointer(index),
        }),
    ])
}

/// Storage of the shared configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookConfigStore: Send + Sync {
    /// Current configuration, `None` when it does not exist
    async fn get(&self) -> Result<Option<MutatingWebhookConfiguration>, WebhookError>;

    /// Create the configuration
    async fn create(&self, config: &MutatingWebhookConfiguration) -> Result<(), WebhookError>;

    /// Apply a JSON patch to the configuration
    async fn patch(&self, ops: Vec<PatchOperation>) -> Result<(), WebhookError>;

    /// Delete the configuration, guarded by `resource_version` when given
    async fn delete(&self, resource_version: Option<String>) -> Result<(), WebhookError>;
}

/// [`WebhookConfigStore`] backed by the Kubernetes API
pub struct KubeWebhookConfigStore {
    api: Api<MutatingWebhookConfiguration>,
}

impl KubeWebhookConfigStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl WebhookConfigStore for KubeWebhookConfigStore {
    async fn get(&self) -> Result<Option<MutatingWebhookConfiguration>, WebhookError> {
        Ok(self.api.get_opt(WEBHOOK_CONFIG_NAME).await?)
    }

    async fn create(&self, config: &MutatingWebhookConfiguration) -> Result<(), WebhookError> {
        self.api.create(&PostParams::default(), config).await?;
        Ok(())
    }

    async fn patch(&self, ops: Vec<PatchOperation>) -> Result<(), WebhookError> {
        self.api
            .patch(
                WEBHOOK_CONFIG_NAME,
                &PatchParams::default(),
                &Patch::Json::<()>(json_patch::Patch(ops)),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, resource_version: Option<String>) -> Result<(), WebhookError> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        match self.api.delete(WEBHOOK_CONFIG_NAME, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps one webhook entry per Rule in the shared configuration
pub struct WebhookConfigSynchronizer {
    store: Arc<dyn WebhookConfigStore>,
    template: WebhookTemplate,
    retry: RetryConfig,
}

impl WebhookConfigSynchronizer {
    /// Create a synchronizer writing through `store`
    pub fn new(store: Arc<dyn WebhookConfigStore>, template: WebhookTemplate) -> Self {
        Self {
            store,
            template,
            retry: RetryConfig::conflict(),
        }
    }

    /// Install or refresh the entry for `rule`
    pub async fn upsert(&self, rule: &str, spec: &RuleSpec) -> Result<(), WebhookError> {
        let entry = &build_webhook_entry(rule, spec, &self.template);
        let this = self;
        retry_with_backoff_if(
            &self.retry,
            "upsert webhook entry",
            WebhookError::is_stale_write,
            || async move {
                let current = this.store.get().await?;
                let change = plan_upsert(current.as_ref(), entry)?;
                this.apply(rule, change).await
            },
        )
        .await
    }

    /// Drop the entry for `rule`, deleting the configuration with the last one
    pub async fn remove(&self, rule: &str) -> Result<(), WebhookError> {
        let name = &webhook_entry_name(rule);
        let this = self;
        retry_with_backoff_if(
            &self.retry,
            "remove webhook entry",
            WebhookError::is_stale_write,
            || async move {
                let current = this.store.get().await?;
                let change = plan_remove(current.as_ref(), name);
                this.apply(rule, change).await
            },
        )
        .await
    }

    async fn apply(&self, rule: &str, change: ConfigChange) -> Result<(), WebhookError> {
        match change {
            ConfigChange::Create(config) => {
                info!(rule = %rule, config = WEBHOOK_CONFIG_NAME, "Creating webhook configuration");
                self.store.create(&config).await
            }
            ConfigChange::Patch(ops) => {
                debug!(rule = %rule, operations = ops.len(), "Patching webhook configuration");
                self.store.patch(ops).await
            }
            ConfigChange::Delete { resource_version } => {
                info!(rule = %rule, config = WEBHOOK_CONFIG_NAME, "Deleting webhook configuration with its last entry");
                self.store.delete(resource_version).await
            }
            ConfigChange::Unchanged => {
                debug!(rule = %rule, "Webhook configuration already up to date");
                Ok(())
            }
        }
    }
}
