//! Long-running loops and the spawner that hosts them.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::core::dispatcher::{Dispatcher, TaskHandler, TaskKind, TaskStore};
use crate::core::outbox::{OutboxConnection, OutboxPublisher};
use crate::core::resource_pool::ResourceManager;

/// Abstraction over async task spawning so runtimes can be swapped.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// A loop that runs until its shutdown signal flips to `true`.
#[async_trait]
pub trait BackgroundLoop: Send + Sync + 'static {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Run until shutdown.
    async fn run(&self, shutdown: watch::Receiver<bool>);
}

#[async_trait]
impl<M> BackgroundLoop for OutboxPublisher<M>
where
    M: ResourceManager,
    M::Resource: OutboxConnection,
{
    fn name(&self) -> &'static str {
        "outbox-publisher"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_loop(shutdown).await;
    }
}

#[async_trait]
impl<P, S, H> BackgroundLoop for Dispatcher<P, S, H>
where
    P: TaskKind,
    S: TaskStore<P>,
    H: TaskHandler<P>,
{
    fn name(&self) -> &'static str {
        "task-dispatcher"
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.run_loop(shutdown).await;
    }
}
