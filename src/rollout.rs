use crate::digest_state::DigestMap;
use crate::selector::ContainerInfo;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt;
use std::fmt::Debug;
use tracing::debug;

pub const ENABLE_ANNOTATION: &str = "image-updater.eznix86.github.io/enabled";
pub const LAST_DIGEST_ANNOTATION: &str = "image-updater.eznix86.github.io/last-digest";
static KUBE_IMAGE_UPDATER_ANNOTATION: &str = "image-updater.eznix86.github.io/restartedAt";
static KUBE_IMAGE_UPDATER_FIELD_MANAGER: &str = "kube-image-updater";
static KUBECTL_ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the workload being reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    pub force_image_pull_policy_always: bool,
    pub enable_kubectl_annotation: bool,
}

impl PatchOptions {
    pub fn restart_annotation(&self) -> &'static str {
        match self.enable_kubectl_annotation {
            true => KUBECTL_ROLLOUT_ANNOTATION,
            false => KUBE_IMAGE_UPDATER_ANNOTATION,
        }
    }
}

/// Builds the rollout patch. The body is the same for every workload kind:
/// the new digests on the workload, a fresh restart marker on the pod
/// template and, when forced, `imagePullPolicy: Always` for every container
/// that does not already have it.
pub fn build_patch(
    digests: &DigestMap,
    containers: &[ContainerInfo],
    options: &PatchOptions,
    now: DateTime<Utc>,
) -> Value {
    let restart_annotation = options.restart_annotation();
    let restarted_at = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut patch = json!({
        "metadata": {
            "annotations": {
                LAST_DIGEST_ANNOTATION: digests.encode(),
            }
        },
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        restart_annotation: restarted_at,
                    }
                }
            }
        }
    });

    if options.force_image_pull_policy_always {
        let overrides: Vec<Value> = containers
            .iter()
            .filter(|c| c.needs_pull_policy_update())
            .map(|c| json!({ "name": c.name, "imagePullPolicy": "Always" }))
            .collect();

        // Leave the sub-path out entirely when nothing needs it.
        if !overrides.is_empty() {
            patch["spec"]["template"]["spec"] = json!({ "containers": overrides });
        }
    }

    patch
}

/// Applies a rollout patch to the cluster.
#[async_trait]
pub trait WorkloadPatcher: Send + Sync {
    async fn apply_patch(&self, workload: &WorkloadRef, patch: &Value) -> anyhow::Result<()>;
}

pub struct KubePatcher {
    client: Client,
}

impl KubePatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadPatcher for KubePatcher {
    async fn apply_patch(&self, workload: &WorkloadRef, patch: &Value) -> anyhow::Result<()> {
        let client = self.client.clone();
        match workload.kind {
            WorkloadKind::Deployment => patch_workload::<Deployment>(client, workload, patch).await,
            WorkloadKind::StatefulSet => patch_workload::<StatefulSet>(client, workload, patch).await,
            WorkloadKind::DaemonSet => patch_workload::<DaemonSet>(client, workload, patch).await,
        }
    }
}

/// The workload resources that carry a pod template and can be rolled out.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;
}

async fn patch_workload<K: Workload>(
    client: Client,
    workload: &WorkloadRef,
    patch: &Value,
) -> anyhow::Result<()> {
    let api: Api<K> = Api::namespaced(client, &workload.namespace);
    let params = PatchParams {
        field_manager: Some(KUBE_IMAGE_UPDATER_FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    debug!("Patching {} with patch {}", workload, patch);
    // Strategic merge keeps the container list keyed by name.
    api.patch(&workload.name, &params, &Patch::Strategic(patch))
        .await
        .with_context(|| format!("Failed to patch {} to trigger rollout", workload))?;
    Ok(())
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 45).unwrap()
    }

    fn digests() -> DigestMap {
        [("app", "sha256:new"), ("sidecar", "sha256:side")]
            .into_iter()
            .collect()
    }

    const NO_FORCE: PatchOptions = PatchOptions {
        force_image_pull_policy_always: false,
        enable_kubectl_annotation: true,
    };

    #[test]
    fn test_build_patch_sets_digest_and_restart_marker() {
        let patch = build_patch(&digests(), &[], &NO_FORCE, now());
        assert_eq!(
            patch,
            json!({
                "metadata": {
                    "annotations": {
                        "image-updater.eznix86.github.io/last-digest": "app:sha256:new,sidecar:sha256:side"
                    }
                },
                "spec": {
                    "template": {
                        "metadata": {
                            "annotations": {
                                "kubectl.kubernetes.io/restartedAt": "2026-10-19T12:30:45Z"
                            }
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_build_patch_own_restart_annotation() {
        let options = PatchOptions {
            enable_kubectl_annotation: false,
            ..NO_FORCE
        };
        let patch = build_patch(&digests(), &[], &options, now());
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"]["image-updater.eznix86.github.io/restartedAt"],
            "2026-10-19T12:30:45Z"
        );
    }

    #[test]
    fn test_build_patch_forces_pull_policy() {
        let containers = vec![
            ContainerInfo::new("app", "app:1").with_pull_policy("IfNotPresent"),
            ContainerInfo::new("sidecar", "sidecar:1").with_pull_policy("Always"),
            ContainerInfo::new("untracked", "other:1"),
        ];
        let options = PatchOptions {
            force_image_pull_policy_always: true,
            ..NO_FORCE
        };
        let patch = build_patch(&digests(), &containers, &options, now());
        assert_eq!(
            patch["spec"]["template"]["spec"],
            json!({
                "containers": [
                    { "name": "app", "imagePullPolicy": "Always" },
                    { "name": "untracked", "imagePullPolicy": "Always" },
                ]
            })
        );
    }

    #[test]
    fn test_build_patch_omits_pull_policy_when_not_needed() {
        let containers = vec![ContainerInfo::new("app", "app:1").with_pull_policy("Always")];
        let options = PatchOptions {
            force_image_pull_policy_always: true,
            ..NO_FORCE
        };
        let patch = build_patch(&digests(), &containers, &options, now());
        assert!(patch["spec"]["template"].get("spec").is_none());

        let unforced = build_patch(
            &digests(),
            &[ContainerInfo::new("app", "app:1")],
            &NO_FORCE,
            now(),
        );
        assert!(unforced["spec"]["template"].get("spec").is_none());
    }

    #[test]
    fn test_workload_pod_spec() {
        use k8s_openapi::api::apps::v1::DeploymentSpec;
        use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};

        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(deployment.pod_spec().unwrap().containers[0].name, "app");
        assert!(DaemonSet::default().pod_spec().is_none());
        assert_eq!(StatefulSet::KIND, WorkloadKind::StatefulSet);
    }

    #[test]
    fn test_annotation_keys_match_existing_deployments() {
        use crate::selector::{
            IGNORE_CONTAINERS_ANNOTATION, TRACK_CONTAINERS_ANNOTATION,
            TRACK_INIT_CONTAINERS_ANNOTATION,
        };

        assert_eq!(ENABLE_ANNOTATION, "image-updater.eznix86.github.io/enabled");
        assert_eq!(
            LAST_DIGEST_ANNOTATION,
            "image-updater.eznix86.github.io/last-digest"
        );
        assert_eq!(
            TRACK_CONTAINERS_ANNOTATION,
            "image-updater.eznix86.github.io/track-containers"
        );
        assert_eq!(
            IGNORE_CONTAINERS_ANNOTATION,
            "image-updater.eznix86.github.io/ignore-containers"
        );
        assert_eq!(
            TRACK_INIT_CONTAINERS_ANNOTATION,
            "image-updater.eznix86.github.io/track-init-containers"
        );
    }

    #[test]
    fn test_workload_display() {
        assert_eq!(WorkloadKind::StatefulSet.to_string(), "statefulset");
        assert_eq!(
            WorkloadRef::new(WorkloadKind::Deployment, "web", "default").to_string(),
            "deployment/default/web"
        );
    }
}
