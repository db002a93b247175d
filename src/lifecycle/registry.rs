use std::collections::BTreeMap;
use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::{Handle, PerCoreDevice};
use crate::sample::Flavor;

/// Addressable name of one (core, flavor) session, `cpu/<core>/ibs/<flavor>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub core: u32,
    pub flavor: Flavor,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu/{}/ibs/{}", self.core, self.flavor)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::InvalidInput, format!("not an IBS endpoint: {s:?}"));
        let rest = s.strip_prefix("cpu/").ok_or_else(invalid)?;
        let (core, flavor) = rest.split_once("/ibs/").ok_or_else(invalid)?;
        let core = core.parse().map_err(|_| invalid())?;
        let flavor = match flavor {
            "op" => Flavor::Op,
            "fetch" => Flavor::Fetch,
            _ => return Err(invalid()),
        };
        Ok(Self { core, flavor })
    }
}

/// Makes endpoints visible to consumers.
pub trait Registry: Send + Sync {
    fn publish(&self, endpoint: Endpoint, dev: &Arc<PerCoreDevice>) -> Result<()>;

    fn unpublish(&self, endpoint: Endpoint) -> Result<()>;
}

/// In-memory [`Registry`] that consumers open endpoints from by name.
#[derive(Default)]
pub struct DeviceTable {
    nodes: RwLock<BTreeMap<Endpoint, Arc<PerCoreDevice>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published endpoints in (core, flavor) order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.keys().copied().collect()
    }

    pub fn contains(&self, endpoint: Endpoint) -> bool {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.contains_key(&endpoint)
    }

    pub fn get(&self, endpoint: Endpoint) -> Option<Arc<PerCoreDevice>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.get(&endpoint).cloned()
    }

    /// Opens a published endpoint such as `cpu/0/ibs/op`.
    pub fn open(&self, name: &str) -> crate::Result<Handle> {
        let endpoint: Endpoint = name.parse()?;
        let dev = self
            .get(endpoint)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{endpoint} is not published")))?;
        dev.open()
    }
}

impl Registry for DeviceTable {
    fn publish(&self, endpoint: Endpoint, dev: &Arc<PerCoreDevice>) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if nodes.contains_key(&endpoint) {
            return Err(Error::new(ErrorKind::AlreadyExists, endpoint.to_string()));
        }
        nodes.insert(endpoint, dev.clone());
        Ok(())
    }

    fn unpublish(&self, endpoint: Endpoint) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.remove(&endpoint) {
            Some(_) => Ok(()),
            None => Err(Error::new(ErrorKind::NotFound, endpoint.to_string())),
        }
    }
}
