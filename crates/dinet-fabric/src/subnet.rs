//! A statically routed debug subnet.
//!
//! The subnet control module sits at address 0, the remaining modules at
//! 1, 2, .... Packets from the host are routed on their destination word.
//! Everything the modules send leaves on the host egress link.

use std::collections::{HashMap, VecDeque};

use dinet_core::config::{LinkConfig, TargetConfig};
use dinet_core::{DiAddr, Flit, ModuleIdentity, ModuleType};

use crate::arbiter::PacketArbiter;
use crate::backend::{DynBackend, MapBackend, ScmBackend};
use crate::buffer::ElasticBuffer;
use crate::error::FabricError;
use crate::link::{FlitSink, FlitSource, Link};
use crate::module::DebugModule;
use crate::regaccess::EngineConfig;

/// Extended register window given to modules built from configuration.
const MODULE_REGISTER_SPAN: u16 = 0x100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteState {
    /// Staging the next packet until its `last` flit arrives.
    Collect,
    /// Handing the staged packet to a module.
    Forward(usize),
    /// Discarding the rest of an over-length packet.
    Drop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubnetStats {
    pub steps: u64,
    pub routed_packets: u64,
    /// Packets dropped because nothing lives at their destination.
    pub unroutable_packets: u64,
    /// Packets dropped for exceeding the maximum packet length.
    pub oversized_packets: u64,
    /// Packets lost to full module inboxes.
    pub inbox_dropped: u64,
}

pub struct Subnet {
    modules: Vec<DebugModule>,
    routes: HashMap<DiAddr, usize>,
    module_out: Vec<Link>,
    ingress: ElasticBuffer,
    egress: ElasticBuffer,
    max_packet_len: usize,
    staged: VecDeque<Flit>,
    route: RouteState,
    arbiter: PacketArbiter,
    stats: SubnetStats,
}

impl Subnet {
    /// Build the subnet described by `target`, with a plain register file
    /// behind every non-SCM module.
    pub fn new(link: &LinkConfig, target: &TargetConfig) -> Result<Self, FabricError> {
        let backends = (0..target.modules.len())
            .map(|_| {
                let start = target.backend_boundary;
                let end = start.saturating_add(MODULE_REGISTER_SPAN);
                Box::new(MapBackend::new(start..end)) as DynBackend
            })
            .collect();
        Self::with_backends(link, target, backends)
    }

    /// Build the subnet with caller-supplied backends, one per configured
    /// module in order.
    pub fn with_backends(
        link: &LinkConfig,
        target: &TargetConfig,
        backends: Vec<DynBackend>,
    ) -> Result<Self, FabricError> {
        if backends.len() != target.modules.len() {
            return Err(FabricError::BackendCount {
                modules: target.modules.len(),
                backends: backends.len(),
            });
        }
        let count = target.modules.len() + 1;
        // The host needs an address of its own.
        if count > DiAddr::MAX as usize {
            return Err(FabricError::TooManyModules(count));
        }

        let engine_config = |identity: ModuleIdentity, can_stall: bool| EngineConfig {
            identity,
            can_stall,
            max_reg_width: target.max_reg_width,
            backend_boundary: target.backend_boundary,
        };

        let scm = ScmBackend::new(
            target.system_vendor_id,
            target.system_device_id,
            count as u16,
            link.max_packet_len as u16,
        );
        let mut modules = Vec::with_capacity(count);
        modules.push(DebugModule::new(
            DiAddr::from_word(0),
            engine_config(ModuleIdentity::osd(ModuleType::Scm, 0), true),
            Box::new(scm),
            link.buffer_depth,
            link.max_packet_len,
        )?);
        for (i, (spec, backend)) in target.modules.iter().zip(backends).enumerate() {
            modules.push(DebugModule::new(
                DiAddr::from_word(i as u16 + 1),
                engine_config(spec.identity, spec.can_stall),
                backend,
                link.buffer_depth,
                link.max_packet_len,
            )?);
        }

        let routes = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.address(), i))
            .collect();
        tracing::info!(modules = count, max_packet_len = link.max_packet_len, "subnet built");

        Ok(Self {
            module_out: (0..count).map(|_| Link::new()).collect(),
            modules,
            routes,
            ingress: ElasticBuffer::streaming(link.buffer_depth)?,
            egress: ElasticBuffer::streaming(link.buffer_depth)?,
            max_packet_len: link.max_packet_len,
            staged: VecDeque::with_capacity(link.max_packet_len),
            route: RouteState::Collect,
            arbiter: PacketArbiter::new(),
            stats: SubnetStats::default(),
        })
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module(&self, addr: DiAddr) -> Option<&DebugModule> {
        self.routes.get(&addr).map(|i| &self.modules[*i])
    }

    pub fn module_mut(&mut self, addr: DiAddr) -> Result<&mut DebugModule, FabricError> {
        let i = *self
            .routes
            .get(&addr)
            .ok_or(FabricError::UnknownModule(addr))?;
        Ok(&mut self.modules[i])
    }

    pub fn stats(&self) -> SubnetStats {
        SubnetStats {
            inbox_dropped: self.modules.iter().map(DebugModule::inbox_dropped).sum(),
            ..self.stats
        }
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Where the host pushes flits into the subnet.
    pub fn host_ingress_mut(&mut self) -> &mut dyn FlitSink {
        &mut self.ingress
    }

    /// Where the host pulls flits out of the subnet.
    pub fn host_egress_mut(&mut self) -> &mut dyn FlitSource {
        &mut self.egress
    }

    /// Nothing in flight anywhere.
    pub fn is_idle(&self) -> bool {
        self.ingress.is_empty()
            && self.egress.is_empty()
            && self.staged.is_empty()
            && self.route == RouteState::Collect
            && self.module_out.iter().all(|l| !l.is_valid())
            && self.modules.iter().all(DebugModule::is_idle)
    }

    /// Advance every component by one step.
    pub fn step(&mut self) {
        self.stats.steps += 1;

        let mut outs: Vec<&mut dyn FlitSource> = self
            .module_out
            .iter_mut()
            .map(|l| l as &mut dyn FlitSource)
            .collect();
        self.arbiter.tick(&mut outs, &mut self.egress);

        for (module, out) in self.modules.iter_mut().zip(self.module_out.iter_mut()) {
            module.tick(out);
        }

        self.route_one();
    }

    /// Packets are staged whole before they reach a module, so an
    /// over-length or unroutable packet never occupies a module buffer.
    fn route_one(&mut self) {
        match self.route {
            RouteState::Collect => {
                let Some(flit) = self.ingress.pop() else {
                    return;
                };
                self.staged.push_back(flit);
                if self.staged.len() > self.max_packet_len {
                    self.staged.clear();
                    self.stats.oversized_packets += 1;
                    tracing::warn!(max_packet_len = self.max_packet_len, "packet exceeds maximum length; dropping");
                    if !flit.last {
                        self.route = RouteState::Drop;
                    }
                    return;
                }
                if !flit.last {
                    return;
                }
                let dest = self.staged.front().map_or(0, |f| f.data);
                match self.routes.get(&DiAddr::from_word(dest)) {
                    Some(i) => self.route = RouteState::Forward(*i),
                    None => {
                        self.staged.clear();
                        self.stats.unroutable_packets += 1;
                        tracing::warn!(dest = dest & DiAddr::MAX, "no module at destination; dropping packet");
                    }
                }
            }
            RouteState::Forward(i) => {
                let Some(flit) = self.staged.front().copied() else {
                    self.route = RouteState::Collect;
                    return;
                };
                if self.modules[i].input_mut().push(flit).is_err() {
                    return;
                }
                self.staged.pop_front();
                if self.staged.is_empty() {
                    self.stats.routed_packets += 1;
                    self.route = RouteState::Collect;
                }
            }
            RouteState::Drop => {
                if let Some(flit) = self.ingress.pop() {
                    if flit.last {
                        self.route = RouteState::Collect;
                    }
                }
            }
        }
    }
}
