//! Concrete driver over the libvirt client bindings.
//!
//! The bindings are blocking, so every RPC runs on the blocking thread pool
//! behind a mutex that serializes access to the underlying session. Remote
//! SSH URIs are dialed through an in-process tunnel ([`super::ssh`]) and the
//! libvirt session is opened against the tunnel's local socket; the returned
//! handle owns both and tears them down together.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use super::uri::{self, Endpoint};
use super::xml;
use super::{
    Connector, DomainRef, DomainState, DriverError, GraphicsEndpoint, HardwareInfo, HostInfo,
    Hypervisor, IoCounters, VmInfo, VmSample, graphics_flags,
};
use crate::driver::ssh::SshTunnel;

pub struct LibvirtConnector;

#[async_trait]
impl Connector for LibvirtConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Hypervisor>, DriverError> {
        let endpoint = uri::parse(uri)?;

        let (local_uri, tunnel) = match endpoint {
            Endpoint::Unix { socket } => {
                (format!("qemu+unix:///system?socket={socket}"), None)
            }
            Endpoint::Tcp { host, port } => (format!("qemu+tcp://{host}:{port}/system"), None),
            Endpoint::Ssh {
                user,
                host,
                port,
                remote_socket,
            } => {
                let tunnel = SshTunnel::open(&user, &host, port, &remote_socket).await?;
                (
                    format!(
                        "qemu+unix:///system?socket={}",
                        tunnel.local_socket().display()
                    ),
                    Some(tunnel),
                )
            }
        };

        let dial_uri = local_uri.clone();
        let connection = tokio::task::spawn_blocking(move || Connect::open(Some(&dial_uri)))
            .await
            .map_err(|e| DriverError::Dial(format!("dial task failed: {e}")))?
            .map_err(|e| {
                if let Some(tunnel) = &tunnel {
                    tunnel.close();
                }
                DriverError::Handshake(e.to_string())
            })?;

        info!(%local_uri, "connected to hypervisor");
        Ok(Arc::new(LibvirtHandle {
            connection: Arc::new(Mutex::new(Some(connection))),
            tunnel: Mutex::new(tunnel),
        }))
    }
}

pub struct LibvirtHandle {
    connection: Arc<Mutex<Option<Connect>>>,
    tunnel: Mutex<Option<SshTunnel>>,
}

impl LibvirtHandle {
    /// Runs one blocking libvirt call off the async runtime. The mutex
    /// serializes RPCs on the session.
    async fn call<T, F>(&self, operation: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Connect) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(connection) => operation(connection),
                None => Err(DriverError::Disconnected),
            }
        })
        .await
        .map_err(|e| DriverError::Rpc(format!("driver task failed: {e}")))?
    }
}

#[async_trait]
impl Hypervisor for LibvirtHandle {
    async fn list_domains(&self) -> Result<Vec<DomainRef>, DriverError> {
        self.call(|connection| {
            let flags =
                sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            let domains = connection.list_all_domains(flags).map_err(rpc_error)?;

            let mut refs = Vec::with_capacity(domains.len());
            for domain in domains {
                match domain_ref(&domain) {
                    Ok(domain_ref) => refs.push(domain_ref),
                    Err(error) => warn!(%error, "skipping unreadable domain"),
                }
            }
            Ok(refs)
        })
        .await
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainRef, DriverError> {
        let name = name.to_string();
        self.call(move |connection| {
            let domain = lookup(connection, &name)?;
            domain_ref(&domain)
        })
        .await
    }

    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo, DriverError> {
        let (name, uuid) = (domain.name.clone(), domain.uuid);
        self.call(move |connection| {
            let domain = lookup(connection, &name)?;

            let (raw_state, _reason) = domain.get_state().map_err(rpc_error)?;
            let state = map_state(raw_state);
            let info = domain.get_info().map_err(rpc_error)?;

            // Guest time needs the agent; fall back to -1 like every client does.
            let uptime = if state.is_running() {
                match domain.get_time(0) {
                    Ok((seconds, _nanos)) => seconds,
                    Err(_) => -1,
                }
            } else {
                -1
            };

            let persistent = domain.is_persistent().unwrap_or(false);
            let autostart = domain.get_autostart().unwrap_or(false);

            let xml_desc = domain.get_xml_desc(0).map_err(rpc_error)?;
            let devices = xml::parse_devices(&xml_desc)?;

            Ok(VmInfo {
                uuid,
                name,
                state,
                max_mem_bytes: info.max_mem * 1024,
                memory_bytes: info.memory * 1024,
                vcpu: info.nr_virt_cpu,
                cpu_time_ns: info.cpu_time,
                uptime,
                persistent,
                autostart,
                graphics: graphics_flags(&devices.graphics),
            })
        })
        .await
    }

    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo, DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            let domain = lookup(connection, &name)?;
            let xml_desc = domain.get_xml_desc(0).map_err(rpc_error)?;
            Ok(xml::parse_devices(&xml_desc)?.into_hardware())
        })
        .await
    }

    async fn stats(&self, domain: &DomainRef) -> Result<VmSample, DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            let domain = lookup(connection, &name)?;

            let (raw_state, _reason) = domain.get_state().map_err(rpc_error)?;
            let state = map_state(raw_state);
            let info = domain.get_info().map_err(rpc_error)?;

            if !state.is_running() {
                return Ok(VmSample::idle(state, info.max_mem * 1024, info.nr_virt_cpu));
            }

            let xml_desc = domain.get_xml_desc(0).map_err(rpc_error)?;
            let devices = xml::parse_devices(&xml_desc)?;

            let mut disks = Vec::new();
            for disk in &devices.disks {
                if disk.device.is_empty() {
                    continue;
                }
                match domain.get_block_stats(&disk.device) {
                    Ok(stats) => disks.push(IoCounters {
                        device: disk.device.clone(),
                        read_bytes: stats.rd_bytes,
                        write_bytes: stats.wr_bytes,
                    }),
                    Err(error) => {
                        debug!(device = %disk.device, %error, "block stats unavailable");
                    }
                }
            }

            let mut nets = Vec::new();
            for interface in &devices.interfaces {
                if interface.device.is_empty() {
                    continue;
                }
                match domain.interface_stats(&interface.device) {
                    Ok(stats) => nets.push(IoCounters {
                        device: interface.device.clone(),
                        read_bytes: stats.rx_bytes,
                        write_bytes: stats.tx_bytes,
                    }),
                    Err(error) => {
                        debug!(device = %interface.device, %error, "interface stats unavailable");
                    }
                }
            }

            Ok(VmSample {
                state,
                memory_bytes: info.memory * 1024,
                max_mem_bytes: info.max_mem * 1024,
                vcpu: info.nr_virt_cpu,
                cpu_time_ns: info.cpu_time,
                disks,
                nets,
            })
        })
        .await
    }

    async fn graphics(&self, domain: &DomainRef) -> Result<Vec<GraphicsEndpoint>, DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            let domain = lookup(connection, &name)?;
            let xml_desc = domain.get_xml_desc(0).map_err(rpc_error)?;
            Ok(xml::parse_devices(&xml_desc)?.graphics)
        })
        .await
    }

    async fn start(&self, domain: &DomainRef) -> Result<(), DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            lookup(connection, &name)?.create().map_err(rpc_error)?;
            Ok(())
        })
        .await
    }

    async fn shutdown(&self, domain: &DomainRef) -> Result<(), DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            lookup(connection, &name)?.shutdown().map_err(rpc_error)?;
            Ok(())
        })
        .await
    }

    async fn reboot(&self, domain: &DomainRef) -> Result<(), DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            lookup(connection, &name)?
                .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
                .map_err(rpc_error)?;
            Ok(())
        })
        .await
    }

    async fn destroy(&self, domain: &DomainRef) -> Result<(), DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            lookup(connection, &name)?.destroy().map_err(rpc_error)?;
            Ok(())
        })
        .await
    }

    async fn reset(&self, domain: &DomainRef) -> Result<(), DriverError> {
        let name = domain.name.clone();
        self.call(move |connection| {
            lookup(connection, &name)?.reset().map_err(rpc_error)?;
            Ok(())
        })
        .await
    }

    async fn host_info(&self) -> Result<HostInfo, DriverError> {
        self.call(|connection| {
            let node = connection.get_node_info().map_err(rpc_error)?;
            let hostname = connection.get_hostname().map_err(rpc_error)?;
            Ok(HostInfo {
                hostname,
                cpu_count: node.cpus,
                // Reported in KiB.
                memory_bytes: node.memory * 1024,
                cores: node.cores,
                threads: node.threads,
            })
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        let connection = Arc::clone(&self.connection);
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.take() {
                Some(mut connection) => {
                    if let Err(error) = connection.close() {
                        warn!(%error, "error closing hypervisor session");
                    }
                    true
                }
                None => false,
            }
        })
        .await
        .map_err(|e| DriverError::Rpc(format!("driver task failed: {e}")))?;

        if let Some(tunnel) = self
            .tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tunnel.close();
        }

        if closed {
            debug!("hypervisor session closed");
        }
        Ok(())
    }
}

fn lookup(connection: &Connect, name: &str) -> Result<Domain, DriverError> {
    Domain::lookup_by_name(connection, name)
        .map_err(|_| DriverError::DomainNotFound(name.to_string()))
}

fn domain_ref(domain: &Domain) -> Result<DomainRef, DriverError> {
    let name = domain.get_name().map_err(rpc_error)?;
    let uuid = domain.get_uuid_string().map_err(rpc_error)?;
    let uuid = Uuid::parse_str(&uuid)
        .map_err(|e| DriverError::Rpc(format!("domain '{name}' has malformed UUID: {e}")))?;
    Ok(DomainRef { name, uuid })
}

fn map_state(raw: sys::virDomainState) -> DomainState {
    match raw {
        sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => DomainState::Active,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
        _ => DomainState::Stopped,
    }
}

fn rpc_error(error: virt::error::Error) -> DriverError {
    DriverError::Rpc(error.to_string())
}
