// Node assembly
//
// Wires one transport and one router onto a radio and spawns the three layer
// tasks on the current tokio runtime. Dropping the Node aborts them.

use crate::config::StackConfig;
use crate::radio::Radio;
use crate::routing::{DiscoveryHook, NoDiscovery, Router};
use crate::transport::Transport;
use crate::{NodeId, StackError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Node {
    config: StackConfig,
    transport: Arc<Transport>,
    router: Arc<Router>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Validate `config` and start the stack; must be called within a tokio runtime
    pub fn spawn(config: StackConfig, radio: Arc<dyn Radio>) -> Result<Self, StackError> {
        Self::spawn_with_discovery(config, radio, Arc::new(NoDiscovery))
    }

    pub fn spawn_with_discovery(
        config: StackConfig,
        radio: Arc<dyn Radio>,
        discovery: Arc<dyn DiscoveryHook>,
    ) -> Result<Self, StackError> {
        config.validate()?;

        let transport = Arc::new(Transport::new(&config, radio));
        let router = Arc::new(Router::with_discovery(
            &config,
            Arc::clone(&transport),
            discovery,
        ));

        let tx = Arc::clone(&transport);
        let rx = Arc::clone(&transport);
        let rt = Arc::clone(&router);
        let tasks = vec![
            tokio::spawn(async move { tx.run_tx().await }),
            tokio::spawn(async move { rx.run_rx().await }),
            tokio::spawn(async move { rt.run().await }),
        ];

        info!(node = config.node_id, "node started");
        Ok(Self {
            config,
            transport,
            router,
            tasks,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Stop the layer tasks
    pub fn shutdown(mut self) {
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(node = self.config.node_id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::radio::SimMedium;

    #[tokio::test]
    async fn test_spawn_rejects_invalid_config() {
        let medium = SimMedium::new();
        let config = StackConfig::for_node(0);
        let result = Node::spawn(config, Arc::new(medium.attach(0)));
        assert!(matches!(
            result,
            Err(StackError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let medium = SimMedium::new();
        let node = Node::spawn(StackConfig::for_node(3), Arc::new(medium.attach(3))).unwrap();
        assert_eq!(node.id(), 3);
        assert_eq!(node.router().node_id(), 3);
        assert_eq!(node.transport().node_id(), 3);
        node.shutdown();
    }
}
