//! The hypervisor driver capability.
//!
//! Everything the rest of the service knows about a hypervisor goes through
//! the [`Hypervisor`] trait: one object per live connection, safe to share
//! across tasks. [`Connector`] is the dial capability the connection pool
//! uses to open new handles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod libvirt;
pub mod ssh;
pub mod uri;
pub mod xml;

#[cfg(test)]
pub mod mock;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unsupported hypervisor URI scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid hypervisor URI: {0}")]
    InvalidUri(String),

    #[error("failed to dial hypervisor: {0}")]
    Dial(String),

    #[error("hypervisor handshake failed: {0}")]
    Handshake(String),

    #[error("domain '{0}' not found")]
    DomainNotFound(String),

    #[error("hypervisor call failed: {0}")]
    Rpc(String),

    #[error("connection is closed")]
    Disconnected,
}

/// Cached power state of a domain, shared vocabulary between the driver and
/// the inventory cache.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    EnumString,
    Display,
    ToSchema,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainState {
    Active,
    Paused,
    Stopped,
    Suspended,
}

impl DomainState {
    pub fn is_running(self) -> bool {
        self == DomainState::Active
    }
}

/// Console capability flags derived from the domain XML. A protocol counts as
/// available only when its port is actually bound (present and not -1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GraphicsInfo {
    pub vnc: bool,
    pub spice: bool,
}

/// Identifies one domain on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub name: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct VmInfo {
    pub uuid: Uuid,
    pub name: String,
    pub state: DomainState,
    pub max_mem_bytes: u64,
    pub memory_bytes: u64,
    pub vcpu: u32,
    pub cpu_time_ns: u64,
    /// Guest uptime in seconds, -1 when the guest clock is unavailable.
    pub uptime: i64,
    pub persistent: bool,
    pub autostart: bool,
    pub graphics: GraphicsInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DiskInfo {
    /// Guest device name, e.g. "vda".
    pub device: String,
    pub bus: String,
    /// Driver format, e.g. "qcow2" or "raw".
    pub format: String,
    /// Backing path, unified from file- and block-backed sources.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct InterfaceInfo {
    pub mac: String,
    pub bridge: String,
    pub model: String,
    /// Host-side device name, e.g. "vnet0". Empty for inactive domains.
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct HardwareInfo {
    pub disks: Vec<DiskInfo>,
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct IoCounters {
    pub device: String,
    pub read_bytes: i64,
    pub write_bytes: i64,
}

/// One point-in-time reading of a domain's counters. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct VmSample {
    pub state: DomainState,
    pub memory_bytes: u64,
    pub max_mem_bytes: u64,
    pub vcpu: u32,
    pub cpu_time_ns: u64,
    pub disks: Vec<IoCounters>,
    pub nets: Vec<IoCounters>,
}

impl VmSample {
    /// Capacity-only sample for a domain that is not running: current state,
    /// zeroed counters.
    pub fn idle(state: DomainState, max_mem_bytes: u64, vcpu: u32) -> Self {
        VmSample {
            state,
            memory_bytes: 0,
            max_mem_bytes,
            vcpu,
            cpu_time_ns: 0,
            disks: Vec::new(),
            nets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HostInfo {
    pub hostname: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum GraphicsKind {
    Vnc,
    Spice,
}

/// One `<graphics>` element of a domain, as the console relay needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsEndpoint {
    pub kind: GraphicsKind,
    /// Bound plain port; None when missing or set to autoport (-1).
    pub port: Option<u16>,
    /// Bound TLS port, same convention.
    pub tls_port: Option<u16>,
    /// Listen address as written in the XML, if any.
    pub listen: Option<String>,
}

/// One live hypervisor connection.
///
/// All methods are safe to call concurrently; the implementation serializes
/// RPCs internally as its transport requires.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// All domains, active and inactive.
    async fn list_domains(&self) -> Result<Vec<DomainRef>, DriverError>;

    async fn lookup_domain(&self, name: &str) -> Result<DomainRef, DriverError>;

    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo, DriverError>;

    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo, DriverError>;

    /// Counter snapshot. Zero counters when the domain is not running.
    async fn stats(&self, domain: &DomainRef) -> Result<VmSample, DriverError>;

    /// Graphics endpoints straight from the domain XML.
    async fn graphics(&self, domain: &DomainRef) -> Result<Vec<GraphicsEndpoint>, DriverError>;

    async fn start(&self, domain: &DomainRef) -> Result<(), DriverError>;
    async fn shutdown(&self, domain: &DomainRef) -> Result<(), DriverError>;
    async fn reboot(&self, domain: &DomainRef) -> Result<(), DriverError>;
    async fn destroy(&self, domain: &DomainRef) -> Result<(), DriverError>;
    async fn reset(&self, domain: &DomainRef) -> Result<(), DriverError>;

    async fn host_info(&self) -> Result<HostInfo, DriverError>;

    /// Tears down the RPC session and any tunnel beneath it. Idempotent.
    async fn disconnect(&self) -> Result<(), DriverError>;
}

/// Dial capability consumed by the connection pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Hypervisor>, DriverError>;
}

/// Collapses graphics endpoints into the capability flags cached per VM.
pub fn graphics_flags(endpoints: &[GraphicsEndpoint]) -> GraphicsInfo {
    let mut flags = GraphicsInfo::default();
    for endpoint in endpoints {
        if endpoint.port.is_some() {
            match endpoint.kind {
                GraphicsKind::Vnc => flags.vnc = true,
                GraphicsKind::Spice => flags.spice = true,
            }
        }
    }
    flags
}
