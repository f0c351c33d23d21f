//! The consensus core of a Tangle node, wired and running.
//!
//! [`NodeContext::build`] constructs every component in dependency order
//! over a storage backend; [`Node::start`] additionally gives each
//! background worker its own thread until [`Node::stop`].

mod context;
mod runner;

pub use context::{NodeContext, NodeError, NodeServices};
pub use runner::WorkerSet;

use tangle_consensus::ConsensusConfig;
use tracing::info;

/// A built context with its workers running.
#[derive(Debug)]
pub struct Node {
    context: NodeContext,
    workers: WorkerSet,
}

impl Node {
    pub fn start(config: ConsensusConfig, services: NodeServices) -> Result<Self, NodeError> {
        let context = NodeContext::build(config, services)?;
        let workers = WorkerSet::spawn(context.workers())?;
        info!(workers = ?workers.names(), "Node started");
        Ok(Self { context, workers })
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    /// Stop and join every worker thread.
    pub fn stop(mut self) {
        self.workers.shutdown();
        info!(
            latest_solid_round = self.context.provider.latest_index(),
            "Node stopped"
        );
    }
}
