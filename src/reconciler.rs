//! Per-workload reconciliation.
//!
//! One invocation selects the tracked containers, resolves every tracked image
//! tag to its current digest, compares the result with the digests stored on
//! the workload and, only on a confirmed change, patches the workload to roll
//! out. Digest resolution is all-or-nothing: a single failing container
//! abandons the invocation without touching stored state.

use crate::config::Config;
use crate::digest_state::{DigestMap, StoredDigests};
use crate::error::Error;
use crate::image_reference::{ImageReference, RegistryDefaults};
use crate::oci_registry::DigestResolver;
use crate::rollout::{
    LAST_DIGEST_ANNOTATION, PatchOptions, WorkloadPatcher, WorkloadRef, build_patch,
};
use crate::selector::{self, ContainerInfo, SelectionPolicy};
use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub registry_defaults: RegistryDefaults,
    pub max_concurrent_fetches: usize,
    pub patch_options: PatchOptions,
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            registry_defaults: config.registry.defaults.clone(),
            max_concurrent_fetches: config.registry.max_concurrent_fetches,
            patch_options: PatchOptions {
                force_image_pull_policy_always: config
                    .feature_flags
                    .force_image_pull_policy_always,
                enable_kubectl_annotation: config.feature_flags.enable_kubectl_annotation,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod template has no containers yet.
    NoContainers,
    /// Selection left nothing to track.
    NothingTracked,
    /// At least one digest could not be resolved; nothing was written.
    FetchFailed { failed: Vec<String> },
    UpToDate,
    RolledOut { digests: DigestMap },
}

pub struct Reconciler {
    resolver: Arc<dyn DigestResolver>,
    patcher: Arc<dyn WorkloadPatcher>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        resolver: Arc<dyn DigestResolver>,
        patcher: Arc<dyn WorkloadPatcher>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            resolver,
            patcher,
            settings,
        }
    }

    pub async fn reconcile(
        &self,
        workload: &WorkloadRef,
        pod_spec: Option<&PodSpec>,
        metadata: &ObjectMeta,
    ) -> anyhow::Result<ReconcileOutcome> {
        let containers = pod_spec
            .map(|spec| ContainerInfo::from_containers(&spec.containers))
            .unwrap_or_default();
        if containers.is_empty() {
            debug!("{}: pod template has no containers, skipping", workload);
            return Ok(ReconcileOutcome::NoContainers);
        }
        let init_containers = pod_spec
            .and_then(|spec| spec.init_containers.as_deref())
            .map(ContainerInfo::from_containers)
            .unwrap_or_default();

        let no_annotations = BTreeMap::new();
        let annotations = metadata.annotations.as_ref().unwrap_or(&no_annotations);

        let policy = SelectionPolicy::from_annotations(annotations);
        let mut tracked = selector::select(&containers, &policy);
        if selector::tracks_init_containers(annotations) {
            tracked.extend(init_containers);
        }
        if tracked.is_empty() {
            debug!("{}: no containers selected for tracking", workload);
            return Ok(ReconcileOutcome::NothingTracked);
        }

        let current = match self.resolve_digests(workload, &tracked).await {
            Ok(current) => current,
            Err(failed) => {
                info!(
                    "{}: skipping update due to failures: {}",
                    workload,
                    failed.join(", ")
                );
                return Ok(ReconcileOutcome::FetchFailed { failed });
            }
        };

        let mut stored =
            StoredDigests::decode(annotations.get(LAST_DIGEST_ANNOTATION).map(String::as_str));
        if stored.is_legacy() {
            info!("{}: migrating legacy digest format", workload);
            stored = stored.migrate_legacy(&tracked[0].name);
        }

        if !stored.has_changed(&current) {
            debug!("{}: digests are up to date ({})", workload, current);
            return Ok(ReconcileOutcome::UpToDate);
        }

        info!(
            "{}: image(s) changed, triggering rollout ({:?} -> {:?})",
            workload,
            stored.encode(),
            current.encode()
        );
        if !self.settings.patch_options.force_image_pull_policy_always {
            warn_misconfigured_pull_policies(workload, &containers);
        }

        let patch = build_patch(&current, &containers, &self.settings.patch_options, Utc::now());
        self.patcher
            .apply_patch(workload, &patch)
            .await
            .with_context(|| format!("Failed to roll out {}", workload))?;
        info!("{}: successfully triggered rollout", workload);

        Ok(ReconcileOutcome::RolledOut { digests: current })
    }

    /// Resolves every tracked container, waiting for all of them. Returns the
    /// names of the failing containers, in tracked order, if any failed.
    async fn resolve_digests(
        &self,
        workload: &WorkloadRef,
        tracked: &[ContainerInfo],
    ) -> Result<DigestMap, Vec<String>> {
        // Stream items are owned: borrowed ones make the reconcile future
        // non-`Send` once it is spawned.
        let results: Vec<(ContainerInfo, Result<String, Error>)> =
            stream::iter(tracked.iter().cloned())
                .map(|container| async move {
                    let result = self.resolve_container(&container).await;
                    (container, result)
                })
                .buffered(self.settings.max_concurrent_fetches)
                .collect()
                .await;

        let mut digests = DigestMap::new();
        let mut failed = Vec::new();
        for (container, result) in results {
            match result {
                Ok(digest) => {
                    debug!(
                        "{}: container {} ({}) is at digest {}",
                        workload, container.name, container.image, digest
                    );
                    digests.insert(container.name, digest);
                }
                Err(e) => {
                    warn!(
                        "{}: failed to fetch digest for {} ({}): {}",
                        workload, container.name, container.image, e
                    );
                    failed.push(container.name);
                }
            }
        }

        if failed.is_empty() {
            Ok(digests)
        } else {
            Err(failed)
        }
    }

    async fn resolve_container(&self, container: &ContainerInfo) -> Result<String, Error> {
        let image_reference =
            ImageReference::parse(&container.image, &self.settings.registry_defaults)?;
        self.resolver.resolve_digest(&image_reference).await
    }
}

fn warn_misconfigured_pull_policies(workload: &WorkloadRef, containers: &[ContainerInfo]) {
    containers
        .iter()
        .filter(|container| container.needs_pull_policy_update())
        .for_each(|container| {
            warn!(
                "{}: container {} has imagePullPolicy {}, should be 'Always' for the rollout to pull the new digest",
                workload,
                container.name,
                container.pull_policy.as_deref().unwrap_or("<unset>")
            )
        });
}
