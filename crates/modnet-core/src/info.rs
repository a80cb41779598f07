//! Descriptive records exchanged between modules.

use crate::{ApplicationId, ModuleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A multicast group joined on one local interface.
///
/// `interface` is the address of the local interface; `0.0.0.0` lets the
/// operating system choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MulticastGroup {
    #[serde(default = "unspecified")]
    pub interface: Ipv4Addr,
    pub group: SocketAddrV4,
}

fn unspecified() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl MulticastGroup {
    pub fn new(interface: Ipv4Addr, group: SocketAddrV4) -> Self {
        Self { interface, group }
    }

    /// Join `group` on whatever interface the operating system picks.
    pub fn any_interface(group: SocketAddrV4) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, group)
    }
}

impl fmt::Display for MulticastGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.group, self.interface)
    }
}

/// What a module says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module_id: ModuleId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl ModuleInfo {
    /// Placeholder used until the module has described itself.
    pub fn unresolved(module_id: ModuleId) -> Self {
        Self {
            module_id,
            name: None,
            location: None,
        }
    }
}

/// A block of an application, as reported by the module running it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: String,
    pub block_type: String,
}

/// An application and the blocks each module runs for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: ApplicationId,
    pub name: String,
    #[serde(default)]
    pub blocks: BTreeMap<ModuleId, Vec<BlockInfo>>,
}

impl ApplicationInfo {
    pub fn new(id: ApplicationId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            blocks: BTreeMap::new(),
        }
    }

    /// Merge two reports of the same application.
    ///
    /// Returns `None` if the ids differ. The name of `self` wins.
    pub fn combine(&self, other: &ApplicationInfo) -> Option<ApplicationInfo> {
        if self.id != other.id {
            return None;
        }
        let mut merged = self.clone();
        for (module, blocks) in &other.blocks {
            let entry = merged.blocks.entry(*module).or_default();
            for block in blocks {
                if !entry.contains(block) {
                    entry.push(block.clone());
                }
            }
        }
        Some(merged)
    }

    /// Modules running at least one block of this application.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleId> {
        self.blocks.keys()
    }
}
