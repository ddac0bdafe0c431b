//! Scriptable in-memory driver for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    Connector, DomainRef, DomainState, DriverError, GraphicsEndpoint, GraphicsInfo, HardwareInfo,
    HostInfo, Hypervisor, VmInfo, VmSample,
};

#[derive(Debug, Clone)]
pub struct MockDomain {
    pub info: VmInfo,
    pub hardware: HardwareInfo,
    pub graphics: Vec<GraphicsEndpoint>,
}

impl MockDomain {
    pub fn new(name: &str, uuid: Uuid, state: DomainState) -> Self {
        MockDomain {
            info: VmInfo {
                uuid,
                name: name.to_string(),
                state,
                max_mem_bytes: 2 * 1024 * 1024 * 1024,
                memory_bytes: 1024 * 1024 * 1024,
                vcpu: 2,
                cpu_time_ns: 5_000_000_000,
                uptime: -1,
                persistent: true,
                autostart: false,
                graphics: GraphicsInfo::default(),
            },
            hardware: HardwareInfo::default(),
            graphics: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct MockHypervisor {
    domains: Mutex<HashMap<String, MockDomain>>,
    pub verbs: Mutex<Vec<(String, String)>>,
    pub fail_stats: AtomicBool,
    pub disconnected: AtomicBool,
    pub hostname: String,
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(MockHypervisor {
            hostname: "mock-host".to_string(),
            ..Default::default()
        })
    }

    pub fn insert(&self, domain: MockDomain) {
        self.domains
            .lock()
            .unwrap()
            .insert(domain.info.name.clone(), domain);
    }

    pub fn remove(&self, name: &str) {
        self.domains.lock().unwrap().remove(name);
    }

    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.domains.lock().unwrap().get_mut(name) {
            domain.info.state = state;
        }
    }

    pub fn update<F: FnOnce(&mut MockDomain)>(&self, name: &str, mutate: F) {
        if let Some(domain) = self.domains.lock().unwrap().get_mut(name) {
            mutate(domain);
        }
    }

    fn with_domain<T>(
        &self,
        name: &str,
        read: impl FnOnce(&MockDomain) -> T,
    ) -> Result<T, DriverError> {
        self.domains
            .lock()
            .unwrap()
            .get(name)
            .map(read)
            .ok_or_else(|| DriverError::DomainNotFound(name.to_string()))
    }

    fn record(&self, verb: &str, name: &str) {
        self.verbs
            .lock()
            .unwrap()
            .push((verb.to_string(), name.to_string()));
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_domains(&self) -> Result<Vec<DomainRef>, DriverError> {
        Ok(self
            .domains
            .lock()
            .unwrap()
            .values()
            .map(|domain| DomainRef {
                name: domain.info.name.clone(),
                uuid: domain.info.uuid,
            })
            .collect())
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainRef, DriverError> {
        self.with_domain(name, |domain| DomainRef {
            name: domain.info.name.clone(),
            uuid: domain.info.uuid,
        })
    }

    async fn describe(&self, domain: &DomainRef) -> Result<VmInfo, DriverError> {
        self.with_domain(&domain.name, |domain| domain.info.clone())
    }

    async fn hardware(&self, domain: &DomainRef) -> Result<HardwareInfo, DriverError> {
        self.with_domain(&domain.name, |domain| domain.hardware.clone())
    }

    async fn stats(&self, domain: &DomainRef) -> Result<VmSample, DriverError> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(DriverError::Rpc("stats unavailable".to_string()));
        }
        self.with_domain(&domain.name, |domain| {
            let info = &domain.info;
            if info.state.is_running() {
                VmSample {
                    state: info.state,
                    memory_bytes: info.memory_bytes,
                    max_mem_bytes: info.max_mem_bytes,
                    vcpu: info.vcpu,
                    cpu_time_ns: info.cpu_time_ns,
                    disks: Vec::new(),
                    nets: Vec::new(),
                }
            } else {
                VmSample::idle(info.state, info.max_mem_bytes, info.vcpu)
            }
        })
    }

    async fn graphics(&self, domain: &DomainRef) -> Result<Vec<GraphicsEndpoint>, DriverError> {
        self.with_domain(&domain.name, |domain| domain.graphics.clone())
    }

    async fn start(&self, domain: &DomainRef) -> Result<(), DriverError> {
        self.record("start", &domain.name);
        self.set_state(&domain.name, DomainState::Active);
        Ok(())
    }

    async fn shutdown(&self, domain: &DomainRef) -> Result<(), DriverError> {
        self.record("shutdown", &domain.name);
        self.set_state(&domain.name, DomainState::Stopped);
        Ok(())
    }

    async fn reboot(&self, domain: &DomainRef) -> Result<(), DriverError> {
        self.record("reboot", &domain.name);
        Ok(())
    }

    async fn destroy(&self, domain: &DomainRef) -> Result<(), DriverError> {
        self.record("destroy", &domain.name);
        self.set_state(&domain.name, DomainState::Stopped);
        Ok(())
    }

    async fn reset(&self, domain: &DomainRef) -> Result<(), DriverError> {
        self.record("reset", &domain.name);
        Ok(())
    }

    async fn host_info(&self) -> Result<HostInfo, DriverError> {
        Ok(HostInfo {
            hostname: self.hostname.clone(),
            cpu_count: 8,
            memory_bytes: 32 * 1024 * 1024 * 1024,
            cores: 4,
            threads: 2,
        })
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands out pre-registered handles by URI.
#[derive(Default)]
pub struct MockConnector {
    handles: Mutex<HashMap<String, Arc<MockHypervisor>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(MockConnector::default())
    }

    pub fn register(&self, uri: &str, handle: Arc<MockHypervisor>) {
        self.handles.lock().unwrap().insert(uri.to_string(), handle);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Hypervisor>, DriverError> {
        self.handles
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .map(|handle| handle as Arc<dyn Hypervisor>)
            .ok_or_else(|| DriverError::Dial(format!("no route to {uri}")))
    }
}
