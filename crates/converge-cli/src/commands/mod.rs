//! CLI commands

use std::fmt::Display;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use converge_apply::{ClusterTransport, KubeTransport, StatusCache, StatusObserver, Verdict, WaitOptions};
use converge_common::crd::kyma_ref;
use converge_common::kube_utils::create_client;
use converge_common::ResourceRef;

use crate::config::{load_config, Settings};
use crate::{Error, GlobalArgs, Result};

pub mod apply;
pub mod format;
pub mod module;
pub mod wait;

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

/// Everything a command needs to talk to the cluster
pub struct Context {
    pub settings: Settings,
    pub transport: Arc<dyn ClusterTransport>,
}

impl Context {
    /// Merge flags over `~/.converge/config.json` and build a kube client
    pub async fn resolve(global: &GlobalArgs) -> Result<Self> {
        let settings = Settings::merge(global, load_config()?)?;
        debug!(
            kubeconfig = ?settings.kubeconfig,
            kyma = %settings.kyma_name,
            namespace = %settings.namespace,
            "resolved settings"
        );
        let client = create_client(settings.kubeconfig.as_deref()).await?;
        Ok(Self {
            settings,
            transport: Arc::new(KubeTransport::new(client)),
        })
    }

    /// Reference to the configured Kyma resource
    pub fn kyma(&self) -> ResourceRef {
        kyma_ref(&self.settings.kyma_name, &self.settings.namespace)
    }

    /// Wait options bounded by `--timeout` and cancelled on Ctrl-C
    pub fn wait_options(&self) -> WaitOptions {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                on_signal.cancel();
            }
        });
        WaitOptions::new(self.settings.timeout).with_cancel(cancel)
    }
}

/// Prints each distinct status of a resource once while waiting
#[derive(Debug, Default)]
pub struct PrintObserver {
    cache: StatusCache,
}

impl PrintObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The line printed for `verdict`, or `None` when it was already shown
    fn line(&mut self, key: &ResourceRef, verdict: &Verdict) -> Option<String> {
        let description = verdict.to_string();
        self.cache
            .should_report(key, &description)
            .then(|| format!("{} {}: {}", key.kind, key.name, description))
    }
}

impl StatusObserver for PrintObserver {
    fn observe(&mut self, key: &ResourceRef, verdict: &Verdict) {
        if let Some(line) = self.line(key, verdict) {
            println!("{}", line);
        }
    }
}
