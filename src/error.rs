use std::io;

use thiserror::Error;

use crate::cap::{Erratum, Unsupported};
use crate::lifecycle::Endpoint;

/// Errors returned by the sampling driver.
#[derive(Debug, Error)]
pub enum Error {
    /// The running CPU cannot do instruction-based sampling.
    #[error(transparent)]
    Unsupported(#[from] Unsupported),

    /// A sample buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes of sample buffer")]
    Alloc { bytes: usize },

    /// The naming collaborator refused to publish an endpoint.
    #[error("failed to publish {endpoint}: {source}")]
    Publish {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// A workaround hook failed.
    #[error("workaround for {erratum} failed: {source}")]
    Workaround {
        erratum: Erratum,
        #[source]
        source: io::Error,
    },

    /// The endpoint is already open.
    #[error("device busy")]
    Busy,

    /// The owning core went offline.
    #[error("core is offline")]
    Offline,

    /// The driver was unloaded.
    #[error("driver unloaded")]
    Unloaded,

    /// The read was cancelled by its holder.
    #[error("read cancelled")]
    Cancelled,

    /// A configuration value or read size is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No device state exists for this core.
    #[error("no such core: {0}")]
    NoCore(u32),

    /// Register or registry access failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
