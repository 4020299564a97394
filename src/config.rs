use crate::image_reference::RegistryDefaults;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, ensure};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/kube-image-updater/config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    /// Restricts the scan to one namespace; cluster-wide when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
    #[serde(default = "default_max_concurrent_reconciles")]
    pub max_concurrent_reconciles: usize,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(flatten)]
    pub defaults: RegistryDefaults,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Registry hosts reached over plain HTTP, e.g. `localhost:5000`.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
    #[serde(default)]
    pub credentials: Vec<RegistryCredentials>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            defaults: RegistryDefaults::default(),
            timeout_seconds: default_timeout_seconds(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            insecure_registries: Vec::new(),
            ca_certificate_paths: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Basic credentials presented to the token endpoint of matching registries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    /// Glob matched against the registry host, e.g. `*.azurecr.io`.
    pub hostname_pattern: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    #[serde(default)]
    pub force_image_pull_policy_always: bool,
    #[serde(default = "default_true")]
    pub enable_kubectl_annotation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            force_image_pull_policy_always: false,
            enable_kubectl_annotation: true,
        }
    }
}

fn default_check_interval_seconds() -> u64 {
    300
}

fn default_max_concurrent_reconciles() -> usize {
    8
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_max_concurrent_fetches() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.check_interval_seconds > 0,
            "checkIntervalSeconds must be greater than zero"
        );
        ensure!(
            self.max_concurrent_reconciles > 0,
            "maxConcurrentReconciles must be greater than zero"
        );
        ensure!(
            self.registry.timeout_seconds > 0,
            "registry.timeoutSeconds must be greater than zero"
        );
        ensure!(
            self.registry.max_concurrent_fetches > 0,
            "registry.maxConcurrentFetches must be greater than zero"
        );
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    parse_config(&yaml_str)
}

fn parse_config(yaml_str: &str) -> Result<Config> {
    let expanded = expand_env_vars(yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate()?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    ensure!(
        missing.is_empty(),
        "Missing environment variable(s): {}",
        missing.join(", ")
    );

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_expand_env_vars_success() {
        unsafe {
            env::set_var("KIU_TEST_VAR", "value123");
        }
        let input = "This is a test: ${KIU_TEST_VAR}";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, "This is a test: value123");
        unsafe {
            env::remove_var("KIU_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let input = "This will fail: ${KIU_MISSING_A} ${KIU_MISSING_B}";
        let err = expand_env_vars(input).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable(s): KIU_MISSING_A, KIU_MISSING_B"
        );
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        let expanded = expand_env_vars(input).expect("Expansion should succeed");
        assert_eq!(expanded, input);
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let config = parse_config("{}").expect("Should parse");

        assert_eq!(config.webserver.port, 8080);
        assert_eq!(config.check_interval(), Duration::from_secs(300));
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.registry.defaults, RegistryDefaults::default());
        assert_eq!(config.registry.timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.max_concurrent_fetches, 4);
        assert!(!config.feature_flags.force_image_pull_policy_always);
        assert!(config.feature_flags.enable_kubectl_annotation);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = parse_config("checkIntervalSeconds: 0").unwrap_err();
        assert!(err.to_string().contains("checkIntervalSeconds"));
    }

    #[test]
    fn test_load_config_file() {
        unsafe {
            env::set_var("KIU_TEST_REGISTRY_PASSWORD", "secret_token");
        }
        let yaml_content = r#"
        webserver:
          port: 9090
        checkIntervalSeconds: 60
        watchNamespace: apps
        registry:
          defaultRegistry: mirror.internal
          defaultNamespace: base
          timeoutSeconds: 5
          insecureRegistries:
            - localhost:5000
          credentials:
            - hostnamePattern: "*.example.com"
              username: robot
              password: ${KIU_TEST_REGISTRY_PASSWORD}
        featureFlags:
          forceImagePullPolicyAlways: true
          enableKubectlAnnotation: false
        "#;

        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let path = tmp_file.path();
        fs::write(path, yaml_content).expect("Failed to write to temp file");

        let config = load_config(path).expect("Should load config");

        assert_eq!(config.webserver.port, 9090);
        assert_eq!(config.check_interval_seconds, 60);
        assert_eq!(config.watch_namespace.as_deref(), Some("apps"));
        assert_eq!(config.registry.defaults.registry, "mirror.internal");
        assert_eq!(config.registry.defaults.namespace, "base");
        assert_eq!(config.registry.timeout_seconds, 5);
        assert_eq!(config.registry.insecure_registries, vec!["localhost:5000"]);
        assert_eq!(config.registry.credentials.len(), 1);
        assert_eq!(config.registry.credentials[0].username, "robot");
        assert_eq!(
            config.registry.credentials[0].password.expose_secret(),
            "secret_token"
        );
        assert!(config.feature_flags.force_image_pull_policy_always);
        assert!(!config.feature_flags.enable_kubectl_annotation);
        unsafe {
            env::remove_var("KIU_TEST_REGISTRY_PASSWORD");
        }
    }
}
