//! Byte-stream transports to a XenStore daemon.
//!
//! Two backends are provided:
//! - Unix domain socket exposed by `xenstored`
//! - XenBus character device (shared ring + event channel, driven by the kernel)
//!
//! Both hand back a boxed [`XsStream`]; nothing above this module knows which
//! one is in use.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

use crate::error::{Result, XsError};

/// Duplex, ordered byte stream the packet layer runs on.
pub trait XsStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> XsStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A way of opening a stream to XenStore.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open a new stream.
    async fn connect(&self) -> Result<Box<dyn XsStream>>;

    /// Human-readable location, used in logs and errors.
    fn describe(&self) -> String;
}

/// Transport through the `xenstored` Unix domain socket.
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn connect(&self) -> Result<Box<dyn XsStream>> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            XsError::Connection(format!("error connecting to {}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

/// Transport through the XenBus device.
#[derive(Debug, Clone)]
pub struct XenBusTransport {
    path: PathBuf,
}

impl XenBusTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for XenBusTransport {
    async fn connect(&self) -> Result<Box<dyn XsStream>> {
        let path = self.path.clone();
        let opened = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            // replies are tied to the open file, so both halves share it
            let writer = file.try_clone()?;
            Ok((file, writer))
        })
        .await
        .map_err(|e| XsError::Connection(format!("error opening {}: {}", self.path.display(), e)))?;
        let (reader, writer) = opened.map_err(|e| {
            XsError::Connection(format!("error opening {}: {}", self.path.display(), e))
        })?;

        // tokio::fs::File runs one blocking operation at a time, so a parked
        // read would hold back every write on a single handle
        let reader = tokio::fs::File::from_std(reader);
        let writer = tokio::fs::File::from_std(writer);
        Ok(Box::new(tokio::io::join(reader, writer)))
    }

    fn describe(&self) -> String {
        format!("xenbus:{}", self.path.display())
    }
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Unix,
    XenBus,
}

/// Connection settings passed explicitly to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub unix_socket_path: PathBuf,
    pub xenbus_path: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Unix,
            unix_socket_path: default_socket_path(),
            xenbus_path: default_xenbus_path(),
        }
    }
}

impl TransportConfig {
    /// Config for a Unix socket at `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TransportKind::Unix,
            unix_socket_path: path.into(),
            ..Default::default()
        }
    }

    /// Config for a XenBus device at `path`.
    pub fn xenbus(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TransportKind::XenBus,
            xenbus_path: path.into(),
            ..Default::default()
        }
    }

    /// Build the transport this config selects.
    pub fn transport(&self) -> Box<dyn Transport> {
        match self.kind {
            TransportKind::Unix => Box::new(UnixSocketTransport::new(&self.unix_socket_path)),
            TransportKind::XenBus => Box::new(XenBusTransport::new(&self.xenbus_path)),
        }
    }
}

/// Socket path the way libxenstore finds it: `XENSTORED_PATH`, then
/// `$XENSTORED_RUNDIR/socket`, then `/var/run/xenstored/socket`.
pub fn default_socket_path() -> PathBuf {
    socket_path_from(
        std::env::var_os("XENSTORED_PATH").map(PathBuf::from),
        std::env::var_os("XENSTORED_RUNDIR").map(PathBuf::from),
    )
}

fn socket_path_from(explicit: Option<PathBuf>, rundir: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        rundir
            .unwrap_or_else(|| PathBuf::from("/var/run/xenstored"))
            .join("socket")
    })
}

/// Platform XenBus device path.
pub fn default_xenbus_path() -> PathBuf {
    let dev = PathBuf::from("/dev/xen/xenbus");
    if cfg!(target_os = "linux") && !dev.exists() {
        // older kernels only expose the proc node
        PathBuf::from("/proc/xen/xenbus")
    } else if cfg!(target_os = "netbsd") {
        PathBuf::from("/kern/xen/xenbus")
    } else {
        dev
    }
}
