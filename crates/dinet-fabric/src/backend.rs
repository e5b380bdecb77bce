//! Register backends: the module-specific side of the register engine.
//!
//! The engine calls [`RegisterBackend::begin`] once per transaction and then
//! [`RegisterBackend::poll`] once per step until it is ready.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::task::Poll;

use dinet_core::reg::scm;
use dinet_core::{RegOp, RegisterTransaction};

/// A backend refused or failed the access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendFault {
    #[error("register 0x{0:04x} is not implemented")]
    Unimplemented(u16),
    #[error("register 0x{0:04x} is read-only")]
    ReadOnly(u16),
    #[error("access to register 0x{0:04x} failed")]
    Failed(u16),
}

pub trait RegisterBackend {
    /// A new transaction is about to be polled.
    fn begin(&mut self, _txn: &RegisterTransaction) {}

    /// Value read (or written) once the access completes.
    fn poll(&mut self, txn: &RegisterTransaction) -> Poll<Result<u128, BackendFault>>;
}

impl<B: RegisterBackend + ?Sized> RegisterBackend for Box<B> {
    fn begin(&mut self, txn: &RegisterTransaction) {
        (**self).begin(txn)
    }

    fn poll(&mut self, txn: &RegisterTransaction) -> Poll<Result<u128, BackendFault>> {
        (**self).poll(txn)
    }
}

/// Boxed backend as stored by a debug module.
pub type DynBackend = Box<dyn RegisterBackend + Send>;

// ── Register map ──────────────────────────────────────────────────────────────

/// A plain register file over an address range.
///
/// Unwritten registers read as zero. Accesses can be made to take several
/// steps, and individual addresses can be made to fail.
#[derive(Debug, Clone)]
pub struct MapBackend {
    range: Range<u16>,
    values: HashMap<u16, u128>,
    latency: u32,
    remaining: u32,
    faulty: HashSet<u16>,
}

impl MapBackend {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            values: HashMap::new(),
            latency: 0,
            remaining: 0,
            faulty: HashSet::new(),
        }
    }

    /// Number of extra steps before each access completes.
    pub fn with_latency(mut self, steps: u32) -> Self {
        self.latency = steps;
        self
    }

    pub fn fail_address(&mut self, address: u16) {
        self.faulty.insert(address);
    }

    pub fn value(&self, address: u16) -> u128 {
        self.values.get(&address).copied().unwrap_or(0)
    }
}

impl RegisterBackend for MapBackend {
    fn begin(&mut self, _txn: &RegisterTransaction) {
        self.remaining = self.latency;
    }

    fn poll(&mut self, txn: &RegisterTransaction) -> Poll<Result<u128, BackendFault>> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Poll::Pending;
        }
        let addr = txn.address;
        if !self.range.contains(&addr) {
            return Poll::Ready(Err(BackendFault::Unimplemented(addr)));
        }
        if self.faulty.contains(&addr) {
            return Poll::Ready(Err(BackendFault::Failed(addr)));
        }
        Poll::Ready(Ok(match txn.op {
            RegOp::Read => self.value(addr) & txn.width.mask(),
            RegOp::Write(value) => {
                self.values.insert(addr, value);
                value
            }
        }))
    }
}

// ── Subnet control module ─────────────────────────────────────────────────────

/// Extended registers of the subnet control module.
#[derive(Debug, Clone)]
pub struct ScmBackend {
    pub system_vendor_id: u16,
    pub system_device_id: u16,
    pub num_modules: u16,
    pub max_packet_len: u16,
    sysrst: u16,
}

impl ScmBackend {
    pub fn new(system_vendor_id: u16, system_device_id: u16, num_modules: u16, max_packet_len: u16) -> Self {
        Self {
            system_vendor_id,
            system_device_id,
            num_modules,
            max_packet_len,
            sysrst: 0,
        }
    }

    pub fn system_in_reset(&self) -> bool {
        self.sysrst & scm::SYSRST_SYS != 0
    }

    pub fn cpus_in_reset(&self) -> bool {
        self.sysrst & scm::SYSRST_CPU != 0
    }

    fn read(&self, address: u16) -> Result<u16, BackendFault> {
        match address {
            scm::SYSTEM_VENDOR_ID => Ok(self.system_vendor_id),
            scm::SYSTEM_DEVICE_ID => Ok(self.system_device_id),
            scm::NUM_MOD => Ok(self.num_modules),
            scm::MAX_PKT_LEN => Ok(self.max_packet_len),
            scm::SYSRST => Ok(self.sysrst),
            other => Err(BackendFault::Unimplemented(other)),
        }
    }
}

impl RegisterBackend for ScmBackend {
    fn poll(&mut self, txn: &RegisterTransaction) -> Poll<Result<u128, BackendFault>> {
        let result = match txn.op {
            RegOp::Read => self.read(txn.address).map(u128::from),
            RegOp::Write(value) if txn.address == scm::SYSRST => {
                self.sysrst = (value as u16) & (scm::SYSRST_SYS | scm::SYSRST_CPU);
                tracing::info!(
                    system = self.system_in_reset(),
                    cpu = self.cpus_in_reset(),
                    "system reset lines changed"
                );
                Ok(value)
            }
            RegOp::Write(_) => self.read(txn.address).and(Err(BackendFault::ReadOnly(txn.address))),
        };
        Poll::Ready(result)
    }
}
