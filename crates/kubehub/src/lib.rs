//! Arcane kube integration: credential acquisition and dynamic client wiring.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use tracing::debug;

use arcane_core::ResourceCoordinates;

/// Source of cluster access credentials.
///
/// The rest of the workspace only needs this one capability; how the
/// kubeconfig is obtained (file on disk, external command) stays here.
#[async_trait::async_trait]
pub trait ConfigReader: Send + Sync {
    async fn read_config(&self) -> Result<Config>;
}

/// Reads a kubeconfig from a fixed path, or from the default resolution
/// chain (`KUBECONFIG`, `~/.kube/config`) when no override is given.
pub struct FileConfigReader {
    override_path: Option<PathBuf>,
}

impl FileConfigReader {
    pub fn new(override_path: Option<PathBuf>) -> Self {
        Self { override_path }
    }
}

#[async_trait::async_trait]
impl ConfigReader for FileConfigReader {
    async fn read_config(&self) -> Result<Config> {
        let kubeconfig = match &self.override_path {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig from {}", path.display()))?,
            None => Kubeconfig::read().context("reading default kubeconfig")?,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("loading kubeconfig")?;
        Ok(config)
    }
}

/// Invokes an external command and parses its stdout as a kubeconfig.
pub struct ExecConfigReader {
    command: String,
    arguments: Vec<String>,
}

impl ExecConfigReader {
    pub fn new(command: impl Into<String>, arguments: Vec<String>) -> Self {
        Self { command: command.into(), arguments }
    }
}

#[async_trait::async_trait]
impl ConfigReader for ExecConfigReader {
    async fn read_config(&self) -> Result<Config> {
        let output = tokio::process::Command::new(&self.command)
            .args(&self.arguments)
            .output()
            .await
            .with_context(|| format!("executing credential command {}", self.command))?;
        if !output.status.success() {
            return Err(anyhow!(
                "credential command {} exited with {}",
                self.command,
                output.status
            ));
        }
        let kubeconfig: Kubeconfig = serde_yaml::from_slice(&output.stdout)
            .with_context(|| format!("parsing output of {} as kubeconfig", self.command))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("loading kubeconfig from command output")?;
        Ok(config)
    }
}

/// Build a client from whatever credential source the caller selected.
pub async fn client_for(reader: &dyn ConfigReader) -> Result<Client> {
    let config = reader.read_config().await?;
    let client = Client::try_from(config).context("building kube client")?;
    debug!("kube client ready");
    Ok(client)
}

/// Map an explicit (group, version, plural) triple onto an `ApiResource`.
///
/// Request paths are built from group/version/plural only; the kind shows up
/// solely in type metadata, which none of the calls in this workspace send.
pub fn api_resource(group: &str, version: &str, plural: &str) -> ApiResource {
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version,
        kind: plural.to_string(),
        plural: plural.to_string(),
    }
}

/// Namespaced dynamic API addressed by discovered coordinates.
pub fn dynamic_api(client: Client, namespace: &str, coords: &ResourceCoordinates) -> Api<DynamicObject> {
    let ar = api_resource(coords.api_group(), coords.api_version(), coords.plural());
    Api::namespaced_with(client, namespace, &ar)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG_YAML: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
users:
- name: test
  user: {}
"#;

    #[test]
    fn api_resource_grouped() {
        let ar = api_resource("streaming.sneaksanddata.com", "v1beta1", "streams");
        assert_eq!(ar.api_version, "streaming.sneaksanddata.com/v1beta1");
        assert_eq!(ar.plural, "streams");
    }

    #[test]
    fn api_resource_core_group() {
        let ar = api_resource("", "v1", "configmaps");
        assert_eq!(ar.api_version, "v1");
    }

    #[tokio::test]
    async fn exec_reader_parses_command_output() {
        let reader = ExecConfigReader::new("echo", vec![KUBECONFIG_YAML.to_string()]);
        let config = reader.read_config().await.expect("config");
        assert!(config.cluster_url.to_string().starts_with("https://127.0.0.1:6443"));
    }

    #[tokio::test]
    async fn exec_reader_rejects_failing_command() {
        let reader = ExecConfigReader::new("false", vec![]);
        assert!(reader.read_config().await.is_err());
    }
}
