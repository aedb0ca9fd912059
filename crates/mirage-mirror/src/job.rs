//! Mirror Job construction
//!
//! A Mirror becomes one Job with `completionMode: Indexed`. Every pod runs
//! the same two scripts; the scripts define `SOURCE_<i>`, `TARGET_<i>` and
//! `PLATFORM_ARG_<i>` for every expanded image and pick their own through
//! `JOB_COMPLETION_INDEX`. The pull phase runs as an init container writing
//! to a shared `emptyDir`, the push phase as the main container.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use mirage_common::crd::{Mirror, MirrorImage, MirrorSpec};
use mirage_common::{MANAGED_BY_LABEL, MIRROR_ANNOTATION, OPERATOR_NAME};

use crate::error::MirrorError;

/// Where the pulled image archive is stored between phases
const ARCHIVE_PATH: &str = "/data/image.tar.gz";

/// Scratch volume shared by the pull and push containers
const DATA_VOLUME: &str = "data";

/// Registry credentials volume
const DOCKER_CONFIG_VOLUME: &str = "dockerconfig";

/// Directory the executor reads registry credentials from
const DOCKER_CONFIG_DIR: &str = "/.docker";

/// Key of the credentials in a `kubernetes.io/dockerconfigjson` Secret
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

const SOURCE_VAR: &str = r"\$SOURCE_${JOB_COMPLETION_INDEX}";
const TARGET_VAR: &str = r"\$TARGET_${JOB_COMPLETION_INDEX}";
const PLATFORM_VAR: &str = r"\$PLATFORM_ARG_${JOB_COMPLETION_INDEX}";

/// One image copy, the unit assigned to a completion index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpandedImage {
    /// Full source reference, including the tag when one was expanded
    pub source: String,
    /// Full target reference
    pub target: String,
    /// Platforms to copy, empty for the executor's default
    pub platforms: Vec<String>,
}

/// Tag assumed for an untagged group whose references carry no tag
const DEFAULT_TAG: &str = "latest";

/// Append `:latest` unless the reference already has a tag or a digest
fn with_default_tag(reference: &str) -> String {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if reference.contains('@') || last_segment.contains(':') {
        reference.to_string()
    } else {
        format!("{reference}:{DEFAULT_TAG}")
    }
}

/// Flatten image groups into the ordered copy list.
///
/// Groups with tags yield one `source:tag` → `target:tag` entry per tag.
/// Groups without tags yield a single entry, defaulting both references to
/// `latest` when they name no tag. The position in the result is the
/// completion index.
pub fn expand_images(images: &[MirrorImage]) -> Vec<ExpandedImage> {
    images
        .iter()
        .flat_map(|image| {
            let expanded: Vec<ExpandedImage> = if image.tags.is_empty() {
                vec![ExpandedImage {
                    source: with_default_tag(&image.source),
                    target: with_default_tag(&image.target),
                    platforms: image.platforms.clone(),
                }]
            } else {
                image
                    .tags
                    .iter()
                    .map(|tag| ExpandedImage {
                        source: format!("{}:{}", image.source, tag),
                        target: format!("{}:{}", image.target, tag),
                        platforms: image.platforms.clone(),
                    })
                    .collect()
            };
            expanded
        })
        .collect()
}

/// Single-quote a value for a POSIX shell assignment
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render the per-index variables followed by one `eval` line per command.
///
/// Values are assigned single-quoted so nothing in them is expanded. Empty
/// command tokens are dropped before joining.
pub fn build_mirror_script(images: &[ExpandedImage], commands: &[Vec<String>]) -> String {
    let mut script = String::new();

    for (i, image) in images.iter().enumerate() {
        let platform_args = image
            .platforms
            .iter()
            .map(|p| format!("--platform {p}"))
            .collect::<Vec<_>>()
            .join(" ");

        let _ = writeln!(script, "PLATFORM_ARG_{i}={}", shell_quote(&platform_args));
        let _ = writeln!(script, "SOURCE_{i}={}", shell_quote(&image.source));
        let _ = writeln!(script, "TARGET_{i}={}", shell_quote(&image.target));
    }

    script.push_str("set -ex\n");

    for command in commands {
        let line = command
            .iter()
            .filter(|token| !token.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(script, "eval \"{line}\"");
    }

    script
}

fn verbose_flag(spec: &MirrorSpec) -> &'static str {
    if spec.verbose {
        "-v"
    } else {
        ""
    }
}

fn command(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

/// Pull phase command
pub fn pull_command(spec: &MirrorSpec) -> Vec<String> {
    command(&["crane", "pull", SOURCE_VAR, ARCHIVE_PATH, PLATFORM_VAR, verbose_flag(spec)])
}

/// Push phase commands, with the provenance annotation when requested
pub fn push_commands(spec: &MirrorSpec) -> Vec<Vec<String>> {
    let verbose = verbose_flag(spec);
    let mut commands = vec![command(&["crane", "push", ARCHIVE_PATH, TARGET_VAR, PLATFORM_VAR, verbose])];

    if spec.set_source_annotation {
        let annotation = format!("mirror-source={SOURCE_VAR}");
        commands.push(command(&["crane", "mutate", "-a", &annotation, TARGET_VAR, verbose]));
    }

    commands
}

fn proxy_env(proxy: &str) -> Vec<EnvVar> {
    ["HTTP_PROXY", "HTTPS_PROXY"]
        .into_iter()
        .map(|name| EnvVar {
            name: name.to_string(),
            value: Some(proxy.to_string()),
            ..Default::default()
        })
        .collect()
}

fn executor_container(
    name: &str,
    image: &str,
    spec: &MirrorSpec,
    mounts: &[VolumeMount],
    script: String,
    with_proxy: bool,
) -> Container {
    let mut env = vec![EnvVar {
        name: "DOCKER_CONFIG".to_string(),
        value: Some(DOCKER_CONFIG_DIR.to_string()),
        ..Default::default()
    }];
    if let Some(proxy) = spec.http_proxy.as_deref().filter(|p| !p.is_empty()) {
        if with_proxy {
            env.extend(proxy_env(proxy));
        }
    }

    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["sh".to_string()]),
        args: Some(vec!["-c".to_string(), script]),
        env: Some(env),
        resources: spec.resources.clone(),
        volume_mounts: Some(mounts.to_vec()),
        ..Default::default()
    }
}

/// Pod template running one image copy per completion index
pub fn build_pod_template(mirror_name: &str, spec: &MirrorSpec, executor_image: &str) -> PodTemplateSpec {
    let images = expand_images(&spec.images);

    let mut volumes = vec![Volume {
        name: DATA_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            size_limit: spec.size_limit.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: DATA_VOLUME.to_string(),
        mount_path: "/data".to_string(),
        ..Default::default()
    }];

    if let Some(secret) = &spec.docker_config {
        volumes.push(Volume {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            secret: Some(secret.clone()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            mount_path: format!("{DOCKER_CONFIG_DIR}/config.json"),
            sub_path: Some(DOCKER_CONFIG_JSON_KEY.to_string()),
            ..Default::default()
        });
    }

    let pull = executor_container(
        "pull",
        executor_image,
        spec,
        &mounts,
        build_mirror_script(&images, &[pull_command(spec)]),
        true,
    );
    let push = executor_container(
        "push",
        executor_image,
        spec,
        &mounts,
        build_mirror_script(&images, &push_commands(spec)),
        spec.push_use_proxy,
    );

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            annotations: Some(BTreeMap::from([(
                MIRROR_ANNOTATION.to_string(),
                mirror_name.to_string(),
            )])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![pull]),
            containers: vec![push],
            volumes: Some(volumes),
            node_selector: spec.node_selector.clone(),
            restart_policy: Some("Never".to_string()),
            active_deadline_seconds: Some(spec.active_deadline_seconds),
            ..Default::default()
        }),
    }
}

/// Label selector matching the Jobs built here
pub fn managed_job_selector() -> String {
    format!("{MANAGED_BY_LABEL}={OPERATOR_NAME}")
}

/// Build the indexed Job for a Mirror, owned by it
pub fn build_mirror_job(mirror: &Mirror, executor_image: &str) -> Result<Job, MirrorError> {
    let name = mirror.name_any();
    let namespace = mirror
        .namespace()
        .ok_or_else(|| MirrorError::invalid(&name, "mirror has no namespace"))?;
    let uid = mirror
        .uid()
        .ok_or_else(|| MirrorError::invalid(&name, "mirror has no uid"))?;

    let completions = i32::try_from(expand_images(&mirror.spec.images).len())
        .map_err(|_| MirrorError::invalid(&name, "too many images"))?;

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                OPERATOR_NAME.to_string(),
            )])),
            owner_references: Some(vec![OwnerReference {
                api_version: Mirror::api_version(&()).to_string(),
                kind: Mirror::kind(&()).to_string(),
                name: name.clone(),
                uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            parallelism: Some(mirror.spec.parallelism),
            completions: Some(completions),
            completion_mode: Some("Indexed".to_string()),
            template: build_pod_template(&name, &mirror.spec, executor_image),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::SecretVolumeSource;

    const EXECUTOR: &str = "gcr.io/go-containerregistry/crane:debug";

    fn image(source: &str, target: &str, tags: &[&str], platforms: &[&str]) -> MirrorImage {
        MirrorImage {
            source: source.to_string(),
            target: target.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn spec(images: Vec<MirrorImage>) -> MirrorSpec {
        serde_json::from_value(serde_json::json!({"images": []}))
            .map(|mut spec: MirrorSpec| {
                spec.images = images;
                spec
            })
            .unwrap()
    }

    fn mirror(spec: MirrorSpec) -> Mirror {
        let mut mirror = Mirror::new("tools", spec);
        mirror.metadata.namespace = Some("mirrors".to_string());
        mirror.metadata.uid = Some("4c1e7f2a".to_string());
        mirror
    }

    fn container_script(job: &Job, init: bool) -> String {
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let container = if init {
            &pod.init_containers.as_ref().unwrap()[0]
        } else {
            &pod.containers[0]
        };
        container.args.as_ref().unwrap()[1].clone()
    }

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn expansion_is_listed_order_then_tag_order() {
        let images = vec![
            image("docker.io/library/nginx", "mirror.local/nginx", &["1.25", "1.27"], &[]),
            image("quay.io/org/tool:v1", "mirror.local/tool:v1", &[], &["linux/amd64"]),
            image("ghcr.io/a/b", "mirror.local/b", &["x"], &[]),
            image("registry:5000/c", "mirror.local/c@sha256:abc", &[], &[]),
        ];

        let expanded = expand_images(&images);
        let pairs: Vec<(&str, &str)> = expanded
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("docker.io/library/nginx:1.25", "mirror.local/nginx:1.25"),
                ("docker.io/library/nginx:1.27", "mirror.local/nginx:1.27"),
                ("quay.io/org/tool:v1", "mirror.local/tool:v1"),
                ("ghcr.io/a/b:x", "mirror.local/b:x"),
                ("registry:5000/c:latest", "mirror.local/c@sha256:abc"),
            ]
        );
        assert_eq!(expanded[2].platforms, vec!["linux/amd64"]);
        assert_eq!(expand_images(&images), expanded);
    }

    #[test]
    fn script_defines_variables_then_evals_commands() {
        let images = vec![
            ExpandedImage {
                source: "nginx:1".to_string(),
                target: "mirror/nginx:1".to_string(),
                platforms: vec!["linux/amd64".to_string(), "linux/arm64".to_string()],
            },
            ExpandedImage {
                source: "redis:7".to_string(),
                target: "mirror/redis:7".to_string(),
                platforms: vec![],
            },
        ];
        let commands = vec![command(&["crane", "pull", SOURCE_VAR, ARCHIVE_PATH, PLATFORM_VAR, ""])];

        let script = build_mirror_script(&images, &commands);

        assert_eq!(
            script,
            concat!(
                "PLATFORM_ARG_0='--platform linux/amd64 --platform linux/arm64'\n",
                "SOURCE_0='nginx:1'\n",
                "TARGET_0='mirror/nginx:1'\n",
                "PLATFORM_ARG_1=''\n",
                "SOURCE_1='redis:7'\n",
                "TARGET_1='mirror/redis:7'\n",
                "set -ex\n",
                "eval \"crane pull \\$SOURCE_${JOB_COMPLETION_INDEX} /data/image.tar.gz \\$PLATFORM_ARG_${JOB_COMPLETION_INDEX}\"\n",
            )
        );
    }

    #[test]
    fn script_values_are_single_quoted() {
        let images = vec![ExpandedImage {
            source: "nginx$(id)".to_string(),
            target: "it's".to_string(),
            platforms: vec![],
        }];

        let script = build_mirror_script(&images, &[]);

        assert!(script.contains("SOURCE_0='nginx$(id)'\n"));
        assert!(script.contains(r"TARGET_0='it'\''s'"));
    }

    #[test]
    fn job_is_indexed_and_owned_by_mirror() {
        let mut spec = spec(vec![
            image("nginx", "mirror/nginx", &["1", "2", "3"], &[]),
            image("redis:7", "mirror/redis:7", &[], &[]),
        ]);
        spec.parallelism = 2;
        let job = build_mirror_job(&mirror(spec), EXECUTOR).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("tools"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("mirrors"));
        assert_eq!(
            job.metadata.labels.as_ref().unwrap()[MANAGED_BY_LABEL],
            OPERATOR_NAME
        );
        assert_eq!(managed_job_selector(), "app.kubernetes.io/managed-by=mirage-operator");

        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Mirror");
        assert_eq!(owner.api_version, "mirage.dev/v1");
        assert_eq!(owner.uid, "4c1e7f2a");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));

        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.completions, Some(4));
        assert_eq!(job_spec.parallelism, Some(2));
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.completion_mode.as_deref(), Some("Indexed"));

        let template = &job_spec.template;
        assert_eq!(
            template.metadata.as_ref().unwrap().annotations.as_ref().unwrap()[MIRROR_ANNOTATION],
            "tools"
        );
        let pod = template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.active_deadline_seconds, Some(3600));
        assert_eq!(pod.containers[0].image.as_deref(), Some(EXECUTOR));
    }

    #[test]
    fn push_script_adds_provenance_when_requested() {
        let mut spec = spec(vec![image("nginx", "mirror/nginx", &[], &[])]);
        spec.set_source_annotation = true;
        spec.verbose = true;
        let job = build_mirror_job(&mirror(spec), EXECUTOR).unwrap();

        let push = container_script(&job, false);
        assert!(push.contains(
            "eval \"crane push /data/image.tar.gz \\$TARGET_${JOB_COMPLETION_INDEX} \\$PLATFORM_ARG_${JOB_COMPLETION_INDEX} -v\"\n"
        ));
        assert!(push.contains(
            "eval \"crane mutate -a mirror-source=\\$SOURCE_${JOB_COMPLETION_INDEX} \\$TARGET_${JOB_COMPLETION_INDEX} -v\"\n"
        ));

        let pull = container_script(&job, true);
        assert!(pull.contains("crane pull"));
        assert!(!pull.contains("crane push"));
    }

    #[test]
    fn proxy_applies_to_push_only_when_enabled() {
        let mut spec = spec(vec![image("nginx", "mirror/nginx", &[], &[])]);
        spec.http_proxy = Some("http://proxy:3128".to_string());

        let job = build_mirror_job(&mirror(spec.clone()), EXECUTOR).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            env_names(&pod.init_containers.unwrap()[0]),
            vec!["DOCKER_CONFIG", "HTTP_PROXY", "HTTPS_PROXY"]
        );
        assert_eq!(env_names(&pod.containers[0]), vec!["DOCKER_CONFIG"]);

        spec.push_use_proxy = true;
        let job = build_mirror_job(&mirror(spec), EXECUTOR).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            env_names(&pod.containers[0]),
            vec!["DOCKER_CONFIG", "HTTP_PROXY", "HTTPS_PROXY"]
        );
    }

    #[test]
    fn docker_config_secret_is_mounted_as_config_json() {
        let mut spec = spec(vec![image("nginx", "mirror/nginx", &[], &[])]);
        spec.docker_config = Some(SecretVolumeSource {
            secret_name: Some("registry-creds".to_string()),
            ..Default::default()
        });

        let job = build_mirror_job(&mirror(spec), EXECUTOR).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();

        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("registry-creds")
        );

        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        let docker = mounts.iter().find(|m| m.name == DOCKER_CONFIG_VOLUME).unwrap();
        assert_eq!(docker.mount_path, "/.docker/config.json");
        assert_eq!(docker.sub_path.as_deref(), Some(".dockerconfigjson"));
    }

    #[test]
    fn mirror_without_namespace_is_rejected() {
        let mut mirror = mirror(spec(vec![image("nginx", "mirror/nginx", &[], &[])]));
        mirror.metadata.namespace = None;
        assert!(matches!(
            build_mirror_job(&mirror, EXECUTOR),
            Err(MirrorError::InvalidMirror { .. })
        ));
    }
}
