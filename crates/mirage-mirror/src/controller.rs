//! Mirror controller
//!
//! Watches Mirrors, their Jobs and the Jobs' pods in one loop. Every event
//! is mapped to a [`MirrorRequest`] naming the Mirror it concerns; objects
//! being deleted and objects that belong to no Mirror are dropped.
//!
//! A failed request is retried with backoff from a fresh read of the object
//! it came from. A periodic full resync relists all three kinds as a safety
//! net for anything the retries gave up on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret, SecretVolumeSource};
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use mirage_common::crd::{find_condition, Mirror, CONDITION_JOB_CREATED};
use mirage_common::kube_utils::is_conflict;
use mirage_common::{API_GROUP_VERSION, COMPLETION_INDEX_LABEL};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::job::{build_mirror_job, expand_images, managed_job_selector};
use crate::status::{pod_mirror, KubeMirrorStatusStore, MirrorStatusSynchronizer};

/// Secret type accepted for registry credentials
pub const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Pause after a watcher error before polling the stream again
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Interval between full relists of Mirrors, Jobs and pods
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Delay before the first retry of a failed request
const REQUEUE_BASE_DELAY: Duration = Duration::from_secs(2);

/// Longest delay between retries of a failed request
const REQUEUE_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retries of one request before it is left to the next resync
pub const MAX_REQUEUE_ATTEMPTS: u32 = 6;

/// Shared context for the Mirror controller
pub struct MirrorContext {
    /// Kubernetes client
    pub client: Client,
    /// Image running the pull and push phases
    pub executor_image: String,
    /// Writer of Mirror status
    pub status: MirrorStatusSynchronizer,
}

impl MirrorContext {
    /// Create a context for the given executor image
    pub fn new(client: Client, executor_image: impl Into<String>) -> Self {
        Self {
            status: MirrorStatusSynchronizer::new(Arc::new(KubeMirrorStatusStore::new(
                client.clone(),
            ))),
            client,
            executor_image: executor_image.into(),
        }
    }
}

/// Work item for one Mirror
#[derive(Clone, Debug)]
pub enum MirrorRequest {
    /// Create the Job of a Mirror that has none yet
    Create(Box<Mirror>),
    /// Fold a Job's status into its Mirror
    JobStatus {
        /// Namespace of the Mirror and its Job
        namespace: String,
        /// Name of the owning Mirror
        mirror: String,
        /// The observed Job
        job: Box<Job>,
    },
    /// Write one pod's state into its image entry
    PodStatus {
        /// Namespace of the Mirror and the pod
        namespace: String,
        /// Name of the owning Mirror
        mirror: String,
        /// The observed pod
        pod: Box<Pod>,
    },
}

impl MirrorRequest {
    /// Request key: `<mirror>`, `<mirror>-job` or `<pod>-pod`
    pub fn key(&self) -> String {
        match self {
            Self::Create(mirror) => mirror.name_any(),
            Self::JobStatus { mirror, .. } => format!("{mirror}-job"),
            Self::PodStatus { pod, .. } => format!("{}-pod", pod.name_any()),
        }
    }

    /// Namespace the request applies to
    pub fn namespace(&self) -> String {
        match self {
            Self::Create(mirror) => mirror.namespace().unwrap_or_default(),
            Self::JobStatus { namespace, .. } | Self::PodStatus { namespace, .. } => {
                namespace.clone()
            }
        }
    }
}

impl fmt::Display for MirrorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.key())
    }
}

/// The object a request was derived from, re-read before a retry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestSource {
    /// A Mirror
    Mirror {
        /// Namespace of the Mirror
        namespace: String,
        /// Name of the Mirror
        name: String,
    },
    /// A Mirror's Job
    Job {
        /// Namespace of the Job
        namespace: String,
        /// Name of the Job
        name: String,
    },
    /// A pod of a Mirror's Job
    Pod {
        /// Namespace of the pod
        namespace: String,
        /// Name of the pod
        name: String,
    },
}

impl fmt::Display for RequestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mirror { namespace, name } => write!(f, "mirror {namespace}/{name}"),
            Self::Job { namespace, name } => write!(f, "job {namespace}/{name}"),
            Self::Pod { namespace, name } => write!(f, "pod {namespace}/{name}"),
        }
    }
}

impl MirrorRequest {
    /// The object this request was mapped from
    pub fn source(&self) -> RequestSource {
        let namespace = self.namespace();
        match self {
            Self::Create(mirror) => RequestSource::Mirror {
                namespace,
                name: mirror.name_any(),
            },
            Self::JobStatus { job, .. } => RequestSource::Job {
                namespace,
                name: job.name_any(),
            },
            Self::PodStatus { pod, .. } => RequestSource::Pod {
                namespace,
                name: pod.name_any(),
            },
        }
    }
}

/// Delay before retry number `attempt`, doubling from two seconds up to a minute
pub fn requeue_delay(attempt: u32) -> Duration {
    REQUEUE_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(REQUEUE_MAX_DELAY)
}

/// Whether the Mirror still needs its Job
pub fn should_create(mirror: &Mirror) -> bool {
    let conditions = mirror
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    find_condition(conditions, CONDITION_JOB_CREATED).is_none()
}

/// Map a Mirror event to a creation request
pub fn request_for_mirror(mirror: &Mirror) -> Option<MirrorRequest> {
    if mirror.meta().deletion_timestamp.is_some() || !should_create(mirror) {
        return None;
    }
    Some(MirrorRequest::Create(Box::new(mirror.clone())))
}

/// Map a Job event to a status request for the Mirror controlling it
pub fn request_for_job(job: &Job) -> Option<MirrorRequest> {
    if job.meta().deletion_timestamp.is_some() || job.status.is_none() {
        return None;
    }
    let owner = job
        .owner_references()
        .iter()
        .find(|o| o.kind == "Mirror" && o.api_version == API_GROUP_VERSION)?;

    Some(MirrorRequest::JobStatus {
        namespace: job.namespace()?,
        mirror: owner.name.clone(),
        job: Box::new(job.clone()),
    })
}

/// Map a Pod event to a status request for the Mirror named in its annotation
pub fn request_for_pod(pod: &Pod) -> Option<MirrorRequest> {
    if pod.meta().deletion_timestamp.is_some() {
        return None;
    }
    let mirror = pod_mirror(pod)?.to_string();

    Some(MirrorRequest::PodStatus {
        namespace: pod.namespace()?,
        mirror,
        pod: Box::new(pod.clone()),
    })
}

/// Check that a registry credentials Secret is usable
pub fn check_docker_config_secret(name: &str, secret: Option<&Secret>) -> Result<(), MirrorError> {
    let secret =
        secret.ok_or_else(|| MirrorError::DockerConfig(format!("secret '{name}' not found")))?;

    match secret.type_.as_deref() {
        Some(DOCKER_CONFIG_SECRET_TYPE) => Ok(()),
        other => Err(MirrorError::DockerConfig(format!(
            "secret '{name}' has type '{}', expected '{DOCKER_CONFIG_SECRET_TYPE}'",
            other.unwrap_or_default()
        ))),
    }
}

async fn verify_docker_config(
    client: &Client,
    namespace: &str,
    source: &SecretVolumeSource,
) -> Result<(), MirrorError> {
    let name = source
        .secret_name
        .as_deref()
        .ok_or_else(|| MirrorError::DockerConfig("secretName is required".to_string()))?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get_opt(name).await?;
    check_docker_config_secret(name, secret.as_ref())
}

async fn create_job(ctx: &MirrorContext, mirror: &Mirror) -> Result<(), MirrorError> {
    let name = mirror.name_any();
    let namespace = mirror
        .namespace()
        .ok_or_else(|| MirrorError::invalid(&name, "mirror has no namespace"))?;

    mirror
        .spec
        .validate()
        .map_err(|message| MirrorError::invalid(&name, message))?;
    if let Some(source) = &mirror.spec.docker_config {
        verify_docker_config(&ctx.client, &namespace, source).await?;
    }

    let job = build_mirror_job(mirror, &ctx.executor_image)?;
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => info!(mirror = %name, namespace = %namespace, "Created mirror job"),
        // A previous attempt created the Job but never recorded it
        Err(e) if is_conflict(&e) => debug!(mirror = %name, "Mirror job already exists"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Handle one request
pub async fn handle_request(ctx: &MirrorContext, request: &MirrorRequest) -> Result<(), MirrorError> {
    match request {
        MirrorRequest::Create(mirror) => {
            let name = mirror.name_any();
            let namespace = mirror.namespace().unwrap_or_default();

            match create_job(ctx, mirror).await {
                Ok(()) => {
                    let images = expand_images(&mirror.spec.images);
                    ctx.status
                        .record_job_created(&namespace, &name, Ok(images.as_slice()))
                        .await
                }
                Err(e) => {
                    warn!(mirror = %name, namespace = %namespace, error = %e, "Failed to create mirror job");
                    let message = e.to_string();
                    ctx.status
                        .record_job_created(&namespace, &name, Err(message.as_str()))
                        .await?;
                    Err(e)
                }
            }
        }
        MirrorRequest::JobStatus {
            namespace,
            mirror,
            job,
        } => match &job.status {
            Some(status) => ctx.status.sync_job(namespace, mirror, status).await,
            None => Ok(()),
        },
        MirrorRequest::PodStatus {
            namespace,
            mirror,
            pod,
        } => ctx.status.sync_pod(namespace, mirror, pod).await,
    }
}

/// A failed request due for another attempt
#[derive(Debug)]
struct Requeue {
    source: RequestSource,
    attempt: u32,
}

/// Schedules failed requests back into the controller loop
#[derive(Clone)]
struct Requeuer {
    tx: mpsc::UnboundedSender<Requeue>,
}

impl Requeuer {
    fn schedule(&self, source: RequestSource, attempt: u32, error: &MirrorError) {
        if attempt >= MAX_REQUEUE_ATTEMPTS {
            warn!(%source, attempt, error = %error, "Mirror request still failing, leaving it to the next resync");
            return;
        }

        let delay = requeue_delay(attempt);
        warn!(%source, attempt, error = %error, retry_in_secs = delay.as_secs(), "Mirror request failed, requeueing");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Only fails once the controller loop is gone
            let _ = tx.send(Requeue {
                source,
                attempt: attempt + 1,
            });
        });
    }
}

/// Re-read the object behind a request and map it again.
///
/// `None` when the object is gone or needs no more work.
async fn refresh(client: &Client, source: &RequestSource) -> Result<Option<MirrorRequest>, MirrorError> {
    let request = match source {
        RequestSource::Mirror { namespace, name } => {
            let api: Api<Mirror> = Api::namespaced(client.clone(), namespace);
            api.get_opt(name).await?.as_ref().and_then(request_for_mirror)
        }
        RequestSource::Job { namespace, name } => {
            let api: Api<Job> = Api::namespaced(client.clone(), namespace);
            api.get_opt(name).await?.as_ref().and_then(request_for_job)
        }
        RequestSource::Pod { namespace, name } => {
            let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
            api.get_opt(name).await?.as_ref().and_then(request_for_pod)
        }
    };
    Ok(request)
}

async fn process(ctx: &MirrorContext, request: MirrorRequest, attempt: u32, requeue: &Requeuer) {
    debug!(request = %request, attempt, "Handling mirror request");
    if let Err(e) = handle_request(ctx, &request).await {
        requeue.schedule(request.source(), attempt, &e);
    }
}

async fn process_requeue(ctx: &MirrorContext, item: Requeue, requeue: &Requeuer) {
    match refresh(&ctx.client, &item.source).await {
        Ok(Some(request)) => process(ctx, request, item.attempt, requeue).await,
        Ok(None) => debug!(source = %item.source, "Requeued object needs no more work"),
        Err(e) => requeue.schedule(item.source, item.attempt, &e),
    }
}

async fn handle_event<T>(
    ctx: &MirrorContext,
    requeue: &Requeuer,
    event: Result<Event<T>, watcher::Error>,
    resource_type: &str,
    to_request: fn(&T) -> Option<MirrorRequest>,
) where
    T: Resource,
{
    match event {
        Ok(Event::Apply(object)) | Ok(Event::InitApply(object)) => {
            if let Some(request) = to_request(&object) {
                process(ctx, request, 0, requeue).await;
            }
        }
        Ok(Event::Delete(_)) => {}
        Ok(Event::Init) | Ok(Event::InitDone) => {
            debug!(%resource_type, "Watcher initialized");
        }
        Err(e) => {
            warn!(error = %e, %resource_type, "Watcher error, will retry");
            tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
        }
    }
}

/// Relist Mirrors, their Jobs and pods and handle each as if it just changed.
///
/// Mirrors go first so a Job created here is recorded before its pods are
/// looked at.
async fn resync(ctx: &MirrorContext, requeue: &Requeuer) -> Result<(), MirrorError> {
    let mirrors: Api<Mirror> = Api::all(ctx.client.clone());
    let jobs: Api<Job> = Api::all(ctx.client.clone());
    let pods: Api<Pod> = Api::all(ctx.client.clone());

    let mirrors = mirrors.list(&ListParams::default()).await?;
    let jobs = jobs
        .list(&ListParams::default().labels(&managed_job_selector()))
        .await?;
    let pods = pods
        .list(&ListParams::default().labels(COMPLETION_INDEX_LABEL))
        .await?;

    let requests: Vec<MirrorRequest> = mirrors
        .items
        .iter()
        .filter_map(request_for_mirror)
        .chain(jobs.items.iter().filter_map(request_for_job))
        .chain(pods.items.iter().filter_map(request_for_pod))
        .collect();

    debug!(requests = requests.len(), "Resyncing mirrors");
    for request in requests {
        process(ctx, request, 0, requeue).await;
    }
    Ok(())
}

/// Run the Mirror controller
pub async fn run(ctx: Arc<MirrorContext>) {
    let mirrors: Api<Mirror> = Api::all(ctx.client.clone());
    let jobs: Api<Job> = Api::all(ctx.client.clone());
    let pods: Api<Pod> = Api::all(ctx.client.clone());

    let mirror_watcher = watcher::watcher(mirrors, watcher::Config::default());
    let job_watcher = watcher::watcher(jobs, watcher::Config::default().labels(&managed_job_selector()));
    // Only indexed-Job pods carry the completion index label
    let pod_watcher = watcher::watcher(pods, watcher::Config::default().labels(COMPLETION_INDEX_LABEL));

    let mut mirror_watcher = std::pin::pin!(mirror_watcher);
    let mut job_watcher = std::pin::pin!(job_watcher);
    let mut pod_watcher = std::pin::pin!(pod_watcher);

    let (tx, mut requeue_rx) = mpsc::unbounded_channel();
    let requeue = Requeuer { tx };

    // The watchers' initial lists cover startup, so skip the immediate tick
    let mut resync_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + RESYNC_INTERVAL,
        RESYNC_INTERVAL,
    );
    resync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Mirror controller started");

    loop {
        tokio::select! {
            Some(event) = mirror_watcher.next() => {
                handle_event(&ctx, &requeue, event, "mirror", request_for_mirror).await;
            }
            Some(event) = job_watcher.next() => {
                handle_event(&ctx, &requeue, event, "job", request_for_job).await;
            }
            Some(event) = pod_watcher.next() => {
                handle_event(&ctx, &requeue, event, "pod", request_for_pod).await;
            }
            Some(item) = requeue_rx.recv() => {
                process_requeue(&ctx, item, &requeue).await;
            }
            _ = resync_interval.tick() => {
                if let Err(e) = resync(&ctx, &requeue).await {
                    warn!(error = %e, "Periodic mirror resync failed");
                }
            }
        }
    }
}
