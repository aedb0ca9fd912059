//! Controller runner - builds the long-running futures of the operator
//!
//! Each `build_*` function returns a boxed future; `main` decides how they
//! are composed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use mirage_common::crd::Rule;
use mirage_mirror::cleanup::run_cleanup;
use mirage_mirror::MirrorContext;
use mirage_webhook::controller::{error_policy, reconcile, RuleContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Rule controller; it stops on SIGTERM/SIGINT
pub fn build_rule_controller(ctx: Arc<RuleContext>) -> BoxedTask {
    let rules: Api<Rule> = Api::all(ctx.client.clone());

    tracing::info!("- Rule controller");

    Box::pin(
        Controller::new(rules, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Rule")),
    )
}

/// Build the Mirror controller watch loop
pub fn build_mirror_controller(ctx: Arc<MirrorContext>) -> BoxedTask {
    tracing::info!("- Mirror controller");
    Box::pin(mirage_mirror::controller::run(ctx))
}

/// Build the finished-Mirror cleanup loop
pub fn build_mirror_cleanup(client: Client, interval: Duration, retention: Duration) -> BoxedTask {
    tracing::info!("- Mirror cleanup");
    Box::pin(run_cleanup(client, interval, retention))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
