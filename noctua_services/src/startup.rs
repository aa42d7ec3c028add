//! Server bootstrap
//!
//! [`Substrate`] wires up a fabric, boots every configured server on its
//! well-known node, and holds the join handles. Construction returns only
//! after every server has passed its alive fence, so clients created
//! afterwards never race the boot.

use crate::{mqueue, name, rmem, semaphore, shm};
use noctua_core::config::SubstrateConfig;
use noctua_core::error::NoctuaResult;
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use noctua_core::topology::NodeId;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A booted service substrate.
pub struct Substrate {
    fabric: Arc<Fabric>,
    config: SubstrateConfig,
    handles: Vec<JoinHandle<()>>,
}

impl Substrate {
    /// Boots the fabric and every configured server, then waits for all of
    /// them to come alive.
    pub fn launch(config: SubstrateConfig) -> NoctuaResult<Self> {
        config.validate()?;
        let fabric = Fabric::with_nodes(config.fabric.nnodes);

        let mut handles = Vec::new();
        handles.push(name::NameServer::spawn(&fabric, config.servers.name));
        handles.push(shm::ShmServer::spawn(&fabric, config.servers.shm));
        handles.push(semaphore::SemaphoreServer::spawn(
            &fabric,
            config.servers.semaphore,
        ));
        handles.push(mqueue::MqueueServer::spawn(&fabric, config.servers.mqueue));
        for (index, &node) in config.servers.rmem.iter().enumerate() {
            handles.push(rmem::RmemServer::spawn(
                &fabric,
                node,
                index,
                config.rmem_data_path,
            ));
        }

        // One-shot fence: every server is listening.
        for node in Self::server_nodes(&config) {
            fabric.fence_wait(node)?;
        }
        log::info!("substrate up: {} servers alive", handles.len());

        Ok(Self {
            fabric,
            config,
            handles,
        })
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    /// Stops every server and joins their threads.
    ///
    /// `runtime` is the node issuing the exit requests (any client node).
    pub fn shutdown(self, runtime: &NodeRuntime) -> NoctuaResult<()> {
        name::send_exit(runtime, self.config.servers.name)?;
        shm::send_exit(runtime, self.config.servers.shm)?;
        semaphore::send_exit(runtime, self.config.servers.semaphore)?;
        mqueue::send_exit(runtime, self.config.servers.mqueue)?;
        for &node in &self.config.servers.rmem {
            rmem::send_exit(runtime, node)?;
        }

        for handle in self.handles {
            handle
                .join()
                .map_err(|_| noctua_core::error::NoctuaError::Internal("server panicked".into()))?;
        }
        log::info!("substrate down");
        Ok(())
    }

    fn server_nodes(config: &SubstrateConfig) -> Vec<NodeId> {
        let mut nodes = vec![
            config.servers.name,
            config.servers.shm,
            config.servers.semaphore,
            config.servers.mqueue,
        ];
        nodes.extend_from_slice(&config.servers.rmem);
        nodes
    }
}
