//! Single-slot process switching.
//!
//! A [`ProcessSwitcher`] holds at most one live server at a time. Callers
//! hand it a spec and a body; the switcher reuses the running process when
//! its configuration accepts the request and swaps processes otherwise.
//! Calls are serialized on a fair lock, so one hand-off is in flight at any
//! moment and queued callers observe FIFO order.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::config::{ServerConfig, ALL_GPU_LAYERS, DEFAULT_HOST};
use crate::error::Result;
use crate::installation::Installation;
use crate::server::{LlamaServer, ServerProcess};

/// A startable process description. The switcher is written against this
/// seam so its coordination logic is independent of llama-server.
#[async_trait]
pub trait ProcessSpec: Send + Sync {
    type Context: ProcessContext;

    /// Whether a process started from `self` satisfies `pending` without a
    /// restart.
    fn accepts(&self, pending: &Self) -> bool;

    /// Launch a process for this spec and hand back its runtime context.
    async fn start(&self) -> Result<Self::Context>;
}

/// Runtime handle produced by [`ProcessSpec::start`].
#[async_trait]
pub trait ProcessContext: Send {
    /// Stop the process and release its resources.
    async fn close(&mut self, force: bool) -> Result<()>;
}

/// llama-server spec: an installation plus the desired configuration.
#[derive(Debug, Clone)]
pub struct LlamaSpec {
    installation: Installation,
    config: ServerConfig,
}

impl LlamaSpec {
    pub fn new(installation: Installation, config: ServerConfig) -> Self {
        Self {
            installation,
            config,
        }
    }

    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[async_trait]
impl ProcessSpec for LlamaSpec {
    type Context = ServerProcess;

    fn accepts(&self, pending: &Self) -> bool {
        self.installation.root() == pending.installation.root()
            && self.config.accepts(&pending.config)
    }

    async fn start(&self) -> Result<ServerProcess> {
        let mut config = self.config.clone();
        config.host = Some(DEFAULT_HOST.to_string());
        config.port = None; // always auto-allocate
        if config.gpu_layers.is_none() && self.installation.has_cuda().await? {
            config.gpu_layers = Some(ALL_GPU_LAYERS);
        }
        let mut server = LlamaServer::new(self.installation.clone(), config);
        server.start().await?;
        ServerProcess::from_server(server)
    }
}

struct Slot<S: ProcessSpec> {
    spec: S,
    context: S::Context,
}

/// Coordinator owning at most one live process.
pub struct ProcessSwitcher<S: ProcessSpec> {
    slot: Mutex<Option<Slot<S>>>,
}

impl<S: ProcessSpec> Default for ProcessSwitcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ProcessSpec> ProcessSwitcher<S> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Run `body` against a process satisfying `spec`, starting or swapping
    /// one if needed. The serializer is held for the whole call, including
    /// the body's own awaits; the process stays alive afterwards for reuse.
    pub async fn with_context<R>(
        &self,
        spec: S,
        body: impl for<'a> FnOnce(&'a S::Context) -> BoxFuture<'a, R> + Send,
    ) -> Result<R> {
        let mut slot = self.slot.lock().await;
        let current = slot.take();
        let active = match current {
            Some(held) if held.spec.accepts(&spec) => held,
            other => {
                if let Some(mut held) = other {
                    held.context.close(false).await?;
                }
                let context = spec.start().await?;
                Slot { spec, context }
            }
        };
        let output = body(&active.context).await;
        *slot = Some(active);
        Ok(output)
    }

    /// Close the current process, if any.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(mut held) = slot.take() {
            held.context.close(false).await?;
        }
        Ok(())
    }

    /// Whether a process is currently held.
    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

#[async_trait]
impl ProcessContext for ServerProcess {
    async fn close(&mut self, force: bool) -> Result<()> {
        ServerProcess::close(self, force).await
    }
}
