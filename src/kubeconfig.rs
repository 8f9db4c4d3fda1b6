//! Kubernetes client configuration
//!
//! A client can be built from raw kubeconfig content (e.g., mounted from a
//! secret), from a kubeconfig file, or by inference (in-cluster service
//! account first, then `$KUBECONFIG` / `~/.kube/config`).

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where to load client configuration from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// Raw kubeconfig YAML
    Content(Vec<u8>),
    /// Path to a kubeconfig file
    Path(std::path::PathBuf),
    /// In-cluster config, falling back to the local kubeconfig
    Infer,
}

impl KubeconfigSource {
    /// Pick a source from optional CLI inputs; content wins over path
    pub fn from_options(content: Option<String>, path: Option<std::path::PathBuf>) -> Self {
        match (content.filter(|c| !c.trim().is_empty()), path) {
            (Some(content), _) => KubeconfigSource::Content(content.into_bytes()),
            (None, Some(path)) => KubeconfigSource::Path(path),
            (None, None) => KubeconfigSource::Infer,
        }
    }
}

/// Parse kubeconfig YAML
pub fn parse_kubeconfig(content: &[u8]) -> Result<Kubeconfig, Error> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::client_config(format!("kubeconfig is not valid UTF-8: {e}")))?;
    Kubeconfig::from_yaml(text)
        .map_err(|e| Error::client_config(format!("failed to parse kubeconfig: {e}")))
}

/// Build a REST config from kubeconfig content using its current context
pub async fn rest_config_from_kubeconfig(content: &[u8]) -> Result<Config, Error> {
    let kubeconfig = parse_kubeconfig(content)?;
    config_from(kubeconfig).await
}

/// Build a REST config from a kubeconfig file
pub async fn rest_config_from_path(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::client_config(format!(
            "failed to read kubeconfig {}: {e}",
            path.display()
        ))
    })?;
    config_from(kubeconfig).await
}

async fn config_from(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::client_config(format!("failed to load kubeconfig: {e}")))
}

/// Resolve a REST config from `source` with default timeouts applied
pub async fn load_config(source: &KubeconfigSource) -> Result<Config, Error> {
    let mut config = match source {
        KubeconfigSource::Content(content) => rest_config_from_kubeconfig(content).await?,
        KubeconfigSource::Path(path) => rest_config_from_path(path).await?,
        KubeconfigSource::Infer => Config::infer()
            .await
            .map_err(|e| Error::client_config(format!("failed to infer config: {e}")))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Create a kube client from `source`
pub async fn create_client(source: &KubeconfigSource) -> Result<Client, Error> {
    let config = load_config(source).await?;
    Client::try_from(config)
        .map_err(|e| Error::client_config(format!("failed to create client: {e}")))
}
