//! Module identity tables.

use std::fmt;

/// Organisation that defined a module's register interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ModuleVendor {
    Unknown,
    Osd,
    Optimsoc,
    LowRisc,
    Other(u16),
}

impl ModuleVendor {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => ModuleVendor::Unknown,
            1 => ModuleVendor::Osd,
            2 => ModuleVendor::Optimsoc,
            3 => ModuleVendor::LowRisc,
            other => ModuleVendor::Other(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ModuleVendor::Unknown => 0,
            ModuleVendor::Osd => 1,
            ModuleVendor::Optimsoc => 2,
            ModuleVendor::LowRisc => 3,
            ModuleVendor::Other(raw) => raw,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModuleVendor::Unknown => "unknown",
            ModuleVendor::Osd => "OSD",
            ModuleVendor::Optimsoc => "OpTiMSoC",
            ModuleVendor::LowRisc => "LowRISC",
            ModuleVendor::Other(_) => "other",
        }
    }
}

impl From<u16> for ModuleVendor {
    fn from(raw: u16) -> Self {
        Self::from_raw(raw)
    }
}

impl From<ModuleVendor> for u16 {
    fn from(v: ModuleVendor) -> u16 {
        v.raw()
    }
}

impl fmt::Display for ModuleVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleVendor::Other(raw) => write!(f, "vendor 0x{raw:04x}"),
            v => f.write_str(v.name()),
        }
    }
}

/// Standard module types. Only meaningful together with [`ModuleVendor::Osd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ModuleType {
    Unknown,
    /// Subnet control module.
    Scm,
    /// UART device emulation.
    DemUart,
    /// Memory access module.
    Mam,
    /// System trace module.
    Stm,
    /// Core trace module.
    Ctm,
    Other(u16),
}

impl ModuleType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => ModuleType::Unknown,
            1 => ModuleType::Scm,
            2 => ModuleType::DemUart,
            3 => ModuleType::Mam,
            4 => ModuleType::Stm,
            5 => ModuleType::Ctm,
            other => ModuleType::Other(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ModuleType::Unknown => 0,
            ModuleType::Scm => 1,
            ModuleType::DemUart => 2,
            ModuleType::Mam => 3,
            ModuleType::Stm => 4,
            ModuleType::Ctm => 5,
            ModuleType::Other(raw) => raw,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            ModuleType::Unknown => "UNKNOWN",
            ModuleType::Scm => "SCM",
            ModuleType::DemUart => "DEM_UART",
            ModuleType::Mam => "MAM",
            ModuleType::Stm => "STM",
            ModuleType::Ctm => "CTM",
            ModuleType::Other(_) => "OTHER",
        }
    }

    pub fn long_name(self) -> &'static str {
        match self {
            ModuleType::Unknown => "unknown module",
            ModuleType::Scm => "subnet control module",
            ModuleType::DemUart => "device emulation module (UART)",
            ModuleType::Mam => "memory access module",
            ModuleType::Stm => "system trace module",
            ModuleType::Ctm => "core trace module",
            ModuleType::Other(_) => "vendor-specific module",
        }
    }
}

impl From<u16> for ModuleType {
    fn from(raw: u16) -> Self {
        Self::from_raw(raw)
    }
}

impl From<ModuleType> for u16 {
    fn from(t: ModuleType) -> u16 {
        t.raw()
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::Other(raw) => write!(f, "type 0x{raw:04x}"),
            t => f.write_str(t.short_name()),
        }
    }
}

/// What a module reports about itself through its base registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModuleIdentity {
    pub vendor: ModuleVendor,
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    pub version: u16,
}

impl ModuleIdentity {
    pub const UNKNOWN: Self = Self {
        vendor: ModuleVendor::Unknown,
        module_type: ModuleType::Unknown,
        version: 0,
    };

    pub fn osd(module_type: ModuleType, version: u16) -> Self {
        Self {
            vendor: ModuleVendor::Osd,
            module_type,
            version,
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} v{}", self.vendor, self.module_type, self.version)
    }
}
