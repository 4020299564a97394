use k8s_openapi::api::core::v1::Container;
use std::collections::{BTreeMap, HashSet};

pub const TRACK_CONTAINERS_ANNOTATION: &str = "image-updater.eznix86.github.io/track-containers";
pub const IGNORE_CONTAINERS_ANNOTATION: &str = "image-updater.eznix86.github.io/ignore-containers";
pub const TRACK_INIT_CONTAINERS_ANNOTATION: &str = "image-updater.eznix86.github.io/track-init-containers";

const PULL_POLICY_ALWAYS: &str = "Always";

/// One container slot of a pod template, regular or init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub pull_policy: Option<String>,
}

impl ContainerInfo {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            pull_policy: None,
        }
    }

    #[cfg(test)]
    pub fn with_pull_policy(mut self, pull_policy: impl Into<String>) -> Self {
        self.pull_policy = Some(pull_policy.into());
        self
    }

    pub fn needs_pull_policy_update(&self) -> bool {
        self.pull_policy.as_deref() != Some(PULL_POLICY_ALWAYS)
    }

    /// Containers without an image cannot be tracked and are left out.
    pub fn from_containers(containers: &[Container]) -> Vec<Self> {
        containers
            .iter()
            .filter_map(|container| {
                let image = container.image.as_ref()?;
                Some(Self {
                    name: container.name.clone(),
                    image: image.clone(),
                    pull_policy: container.image_pull_policy.clone(),
                })
            })
            .collect()
    }
}

/// Allow-list and deny-list of container names read from workload annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub track: HashSet<String>,
    pub ignore: HashSet<String>,
}

impl SelectionPolicy {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            track: parse_name_list(annotations.get(TRACK_CONTAINERS_ANNOTATION)),
            ignore: parse_name_list(annotations.get(IGNORE_CONTAINERS_ANNOTATION)),
        }
    }
}

fn parse_name_list(value: Option<&String>) -> HashSet<String> {
    value
        .map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Picks the tracked containers, preserving input order. A non-empty
/// allow-list wins outright and the deny-list is not consulted.
pub fn select(containers: &[ContainerInfo], policy: &SelectionPolicy) -> Vec<ContainerInfo> {
    if !policy.track.is_empty() {
        return containers
            .iter()
            .filter(|c| policy.track.contains(&c.name))
            .cloned()
            .collect();
    }

    if !policy.ignore.is_empty() {
        return containers
            .iter()
            .filter(|c| !policy.ignore.contains(&c.name))
            .cloned()
            .collect();
    }

    containers.to_vec()
}

pub fn tracks_init_containers(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(TRACK_INIT_CONTAINERS_ANNOTATION)
        .is_some_and(|value| value == "true")
}
