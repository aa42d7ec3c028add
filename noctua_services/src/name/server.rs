//! Name server

use super::*;
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The name server.
pub struct NameServer {
    runtime: Arc<NodeRuntime>,
    /// `bindings[node]` is the name bound to that node, if any.
    bindings: Vec<Option<String>>,
    nrequests: u64,
}

impl NameServer {
    /// Boots a name server on `node`.
    pub fn spawn(fabric: &Arc<Fabric>, node: NodeId) -> JoinHandle<()> {
        let fabric2 = fabric.clone();
        fabric.spawn(node, move || {
            let runtime = NodeRuntime::init(fabric2, node).expect("name server runtime");
            let mut server = NameServer::new(runtime);
            if let Err(err) = server.run() {
                log::error!("[name] server died: {err}");
            }
        })
    }

    pub fn new(runtime: Arc<NodeRuntime>) -> Self {
        let nnodes = runtime.fabric().nnodes();
        Self {
            runtime,
            bindings: vec![None; nnodes],
            nrequests: 0,
        }
    }

    /// Serves requests until an exit frame arrives.
    pub fn run(&mut self) -> NoctuaResult<()> {
        let node = self.runtime.node();
        log::info!("[name] booting on node {node}");
        self.runtime.fabric().fence_signal(node)?;
        log::info!("[name] listening on node {node}");

        loop {
            let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
            let header = ControlHeader::decode(&frame);
            let opcode = match NameOpcode::try_from(header.opcode) {
                Ok(opcode) => opcode,
                Err(err) => {
                    log::warn!("[name] dropping request: {err}");
                    continue;
                }
            };
            if header.source >= self.runtime.fabric().nnodes() {
                log::warn!("[name] dropping request from bad source {}", header.source);
                continue;
            }
            self.nrequests += 1;
            let source = header.source;

            match opcode {
                NameOpcode::Link => {
                    let (name, target) = decode_link(&frame);
                    let result = self.link(target, &name);
                    log::debug!("[name] link {name} -> node {target}: {result:?}");
                    self.reply(source, status_of(result), 0)?;
                }
                NameOpcode::Lookup => {
                    let name = decode_name(&frame);
                    match self.lookup(&name) {
                        Ok(target) => self.reply(source, 0, target)?,
                        Err(err) => self.reply(source, err.code(), 0)?,
                    }
                }
                NameOpcode::Unlink => {
                    let name = decode_name(&frame);
                    let result = self.unlink(&name);
                    self.reply(source, status_of(result), 0)?;
                }
                NameOpcode::Exit => break,
                NameOpcode::Reply => {
                    log::warn!("[name] unexpected reply frame from node {source}");
                }
            }
        }

        log::info!(
            "[name] shutting down on node {node} after {} requests",
            self.nrequests
        );
        Ok(())
    }

    fn reply(&self, dest: NodeId, ret: i32, node: NodeId) -> NoctuaResult<()> {
        let frame = encode_reply(self.runtime.node(), ret, node);
        crate::protocol::send_to(&self.runtime, dest, &frame)
    }

    fn link(&mut self, node: NodeId, name: &str) -> NoctuaResult<()> {
        if name.is_empty() || name.len() >= PROC_NAME_MAX {
            return Err(NoctuaError::NameTooLong(name.to_string()));
        }
        if node >= self.bindings.len() {
            return Err(NoctuaError::invalid(format!("bad node {node}")));
        }
        if self.bindings[node].is_some() {
            return Err(NoctuaError::already_exists(format!("node {node} is bound")));
        }
        if self.bindings.iter().flatten().any(|bound| bound == name) {
            return Err(NoctuaError::already_exists(name));
        }
        self.bindings[node] = Some(name.to_string());
        Ok(())
    }

    fn lookup(&self, name: &str) -> NoctuaResult<NodeId> {
        self.bindings
            .iter()
            .position(|binding| binding.as_deref() == Some(name))
            .ok_or_else(|| NoctuaError::not_found(name))
    }

    fn unlink(&mut self, name: &str) -> NoctuaResult<()> {
        let node = self.lookup(name)?;
        self.bindings[node] = None;
        Ok(())
    }
}

fn status_of(result: NoctuaResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}
