//! Module directory: what the host learned about each module at connect.

use std::sync::Arc;

use dashmap::DashMap;
use dinet_core::{DiAddr, ModuleIdentity, ModuleType};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModuleDescriptor {
    pub address: DiAddr,
    pub identity: ModuleIdentity,
    /// False when the module did not answer its identity registers.
    pub described: bool,
}

impl ModuleDescriptor {
    pub fn unknown(address: DiAddr) -> Self {
        Self {
            address,
            identity: ModuleIdentity::UNKNOWN,
            described: false,
        }
    }
}

/// Shared between the session, its channel tasks, and callers.
/// Keyed on module address.
pub type ModuleDirectory = Arc<DashMap<DiAddr, ModuleDescriptor>>;

pub fn new_directory() -> ModuleDirectory {
    Arc::new(DashMap::new())
}

/// All entries, ordered by address.
pub fn snapshot(directory: &ModuleDirectory) -> Vec<ModuleDescriptor> {
    let mut all: Vec<ModuleDescriptor> = directory.iter().map(|e| e.value().clone()).collect();
    all.sort_by_key(|d| d.address);
    all
}

/// Addresses of every module of the given type, ascending.
pub fn find_by_type(directory: &ModuleDirectory, module_type: ModuleType) -> Vec<DiAddr> {
    let mut found: Vec<DiAddr> = directory
        .iter()
        .filter(|e| e.value().identity.module_type == module_type)
        .map(|e| *e.key())
        .collect();
    found.sort();
    found
}
