//! CLI commands

use std::fmt::Display;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::{Error, Result};

pub mod gc;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Build a kube [`Client`] for the management cluster.
///
/// An explicit kubeconfig path wins; otherwise kube's defaults apply
/// (`KUBECONFIG`, `~/.kube/config`, then in-cluster config).
pub async fn kube_client(kubeconfig: Option<&str>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.cmd_err();
    };

    let kc = Kubeconfig::read_from(path)
        .map_err(|e| Error::command_failed(format!("failed to read kubeconfig {}: {}", path, e)))?;
    let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .cmd_err()?;
    Client::try_from(config).cmd_err()
}
