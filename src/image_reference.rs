use crate::error::Error;
use serde::Deserialize;
use std::fmt;

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";

/// Where unqualified image names (`nginx:latest`, `bitnami/redis:7`) are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistryDefaults {
    #[serde(default = "default_registry", rename = "defaultRegistry")]
    pub registry: String,
    #[serde(default = "default_namespace", rename = "defaultNamespace")]
    pub namespace: String,
}

fn default_registry() -> String {
    DEFAULT_REGISTRY.to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            namespace: default_namespace(),
        }
    }
}

/// A fully qualified `registry/repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl ImageReference {
    pub fn parse(s: &str, defaults: &RegistryDefaults) -> Result<Self, Error> {
        // The rightmost colon always separates the tag, so a registry port
        // (`localhost:5000/app:dev`) stays part of the name.
        let (name, tag) = s.rsplit_once(':').ok_or_else(|| Error::InvalidReference {
            image: s.to_string(),
        })?;

        let Some((first, rest)) = name.split_once('/') else {
            return Ok(Self {
                registry: defaults.registry.clone(),
                repository: format!("{}/{}", defaults.namespace, name),
                tag: tag.to_string(),
            });
        };

        // A first segment that looks like host[:port] names the registry,
        // anything else is a Docker Hub namespace.
        let (registry, repository) = if first.contains('.') || first.contains(':') {
            (first.to_string(), rest.to_string())
        } else {
            (defaults.registry.clone(), name.to_string())
        };

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    pub fn manifest_path(&self) -> String {
        format!("/v2/{}/manifests/{}", self.repository, self.tag)
    }

    /// Token scope requested when the registry challenge does not name one.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}
