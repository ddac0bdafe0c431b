//! Reconciliation between live hypervisor inventory and the cache.
//!
//! Each domain is reconciled in one transaction: the VM row is upserted by
//! `(host_id, domain_uuid)` and the normalized hardware rows are replaced
//! when they drift. Reconciling an unchanged domain performs no writes.
//! Pruning of rows whose domain disappeared runs in a separate transaction
//! after the per-domain passes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::driver::{
    DriverError, GraphicsInfo, HardwareInfo, Hypervisor, VmInfo,
};
use crate::errors::Error;
use crate::model::networks::AttachedPort;
use crate::model::volumes::AttachedVolume;
use crate::model::{graphics, networks, vms, volumes};

/// Syncs one VM by name. Returns whether anything in the cache changed.
pub async fn reconcile_one(
    db: &SqlitePool,
    driver: &Arc<dyn Hypervisor>,
    host_id: &str,
    vm_name: &str,
) -> Result<bool, Error> {
    // All driver traffic happens before the transaction opens, so a slow
    // hypervisor never holds the cache hostage.
    let live = match fetch_live(driver, vm_name).await? {
        Some(live) => live,
        None => return delete_if_cached(db, host_id, vm_name).await,
    };

    let mut tx = db.begin().await?;
    let changed = apply(&mut tx, host_id, &live).await?;
    tx.commit().await?;
    Ok(changed)
}

/// Syncs every domain on the host and prunes cache rows whose domain is
/// gone. Returns whether anything changed.
pub async fn reconcile_host(
    db: &SqlitePool,
    driver: &Arc<dyn Hypervisor>,
    host_id: &str,
) -> Result<bool, Error> {
    let domains = driver.list_domains().await?;
    let mut changed = false;

    for domain in &domains {
        match reconcile_one(db, driver, host_id, &domain.name).await {
            Ok(domain_changed) => changed |= domain_changed,
            Err(error) => {
                warn!(host_id, domain = %domain.name, %error, "failed to reconcile domain");
            }
        }
    }

    let live: HashSet<String> = domains
        .iter()
        .map(|domain| domain.uuid.to_string())
        .collect();

    let mut tx = db.begin().await?;
    for row in vms::list_by_host_tx(&mut tx, host_id).await? {
        if !live.contains(&row.domain_uuid) {
            debug!(host_id, vm = %row.name, "pruning cached VM no longer on host");
            vms::delete(&mut tx, row.id).await?;
            changed = true;
        }
    }
    tx.commit().await?;

    Ok(changed)
}

struct LiveVm {
    info: VmInfo,
    hardware: HardwareInfo,
}

async fn fetch_live(
    driver: &Arc<dyn Hypervisor>,
    vm_name: &str,
) -> Result<Option<LiveVm>, Error> {
    let domain = match driver.lookup_domain(vm_name).await {
        Ok(domain) => domain,
        Err(DriverError::DomainNotFound(_)) => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    // The domain can vanish between lookup and inspection; treat that the
    // same as a lookup miss.
    let info = match driver.describe(&domain).await {
        Ok(info) => info,
        Err(DriverError::DomainNotFound(_)) => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let hardware = match driver.hardware(&domain).await {
        Ok(hardware) => hardware,
        Err(DriverError::DomainNotFound(_)) => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    Ok(Some(LiveVm { info, hardware }))
}

async fn delete_if_cached(db: &SqlitePool, host_id: &str, vm_name: &str) -> Result<bool, Error> {
    let mut tx = db.begin().await?;
    let deleted = match vms::by_host_and_name(&mut tx, host_id, vm_name).await? {
        Some(row) => {
            debug!(host_id, vm = vm_name, "domain gone from host, deleting cache row");
            vms::delete(&mut tx, row.id).await?;
            true
        }
        None => false,
    };
    tx.commit().await?;
    Ok(deleted)
}

async fn apply(
    tx: &mut SqliteConnection,
    host_id: &str,
    live: &LiveVm,
) -> Result<bool, Error> {
    let info = &live.info;
    let domain_uuid = info.uuid.to_string();

    let (vm_id, mut changed) =
        match vms::by_host_and_domain_uuid(tx, host_id, &domain_uuid).await? {
            None => {
                // A domain deleted and recreated under the same name gets a
                // new UUID; drop the stale row so the insert can land.
                if let Some(stale) = vms::by_host_and_name(tx, host_id, &info.name).await? {
                    debug!(host_id, vm = %info.name, "replacing stale cache row for recreated domain");
                    vms::delete(tx, stale.id).await?;
                }

                // A domain restored or cloned onto a second host keeps its
                // hypervisor UUID; the cache-wide identity must stay unique.
                let internal_uuid =
                    if vms::domain_uuid_on_other_host(tx, host_id, &domain_uuid).await? {
                        Uuid::new_v4().to_string()
                    } else {
                        domain_uuid.clone()
                    };

                let id = vms::insert(
                    tx,
                    &vms::VmRecord {
                        host_id: host_id.to_string(),
                        name: info.name.clone(),
                        internal_uuid,
                        domain_uuid,
                        state: info.state,
                        vcpu_count: i64::from(info.vcpu),
                        memory_bytes: info.max_mem_bytes as i64,
                    },
                )
                .await?;
                (id, true)
            }
            Some(row) => {
                let drifted = row.name != info.name
                    || row.state != info.state
                    || row.vcpu_count != i64::from(info.vcpu)
                    || row.memory_bytes != info.max_mem_bytes as i64;
                if drifted {
                    vms::update_live_fields(
                        tx,
                        row.id,
                        &info.name,
                        info.state,
                        i64::from(info.vcpu),
                        info.max_mem_bytes as i64,
                    )
                    .await?;
                }
                (row.id, drifted)
            }
        };

    changed |= sync_hardware(tx, host_id, vm_id, &live.hardware, info.graphics).await?;
    Ok(changed)
}

/// Replaces the VM's normalized hardware rows when the live description
/// differs from what is cached. Ports are upserted by MAC rather than
/// deleted, so a NIC that moves between VMs keeps its row.
async fn sync_hardware(
    tx: &mut SqliteConnection,
    host_id: &str,
    vm_id: i64,
    hardware: &HardwareInfo,
    graphics_info: GraphicsInfo,
) -> Result<bool, Error> {
    let desired_volumes = desired_volumes(hardware);
    let desired_ports = desired_ports(hardware);
    let desired_graphics = desired_graphics(graphics_info);

    let current_volumes = volumes::attached_to_vm(tx, vm_id).await?;
    let current_ports = networks::attached_to_vm(tx, vm_id).await?;
    let current_graphics = graphics::kinds_for_vm(tx, vm_id).await?;

    if current_volumes == desired_volumes
        && current_ports == desired_ports
        && current_graphics == desired_graphics
    {
        return Ok(false);
    }

    networks::unbind_vm_ports(tx, vm_id).await?;
    volumes::detach_all(tx, vm_id).await?;
    graphics::detach_all(tx, vm_id).await?;

    for volume in &desired_volumes {
        let volume_id = volumes::upsert(tx, &volume.path, &volume.format).await?;
        volumes::attach(tx, vm_id, volume_id, &volume.device_name, &volume.bus_type).await?;
    }

    for port in &desired_ports {
        let port_id = networks::upsert_port(
            tx,
            vm_id,
            &port.mac_address,
            &port.model_name,
            &port.device_name,
        )
        .await?;
        let network_id = networks::upsert_network(tx, host_id, &port.bridge_name).await?;
        networks::ensure_binding(tx, port_id, network_id).await?;
    }

    for kind in &desired_graphics {
        let device_id = graphics::upsert_device(tx, kind).await?;
        graphics::attach(tx, vm_id, device_id).await?;
    }

    Ok(true)
}

fn desired_volumes(hardware: &HardwareInfo) -> Vec<AttachedVolume> {
    let mut result: Vec<AttachedVolume> = hardware
        .disks
        .iter()
        .filter(|disk| !disk.path.is_empty())
        .map(|disk| AttachedVolume {
            path: disk.path.clone(),
            format: disk.format.clone(),
            device_name: disk.device.clone(),
            bus_type: disk.bus.clone(),
        })
        .collect();
    result.sort_by(|a, b| a.device_name.cmp(&b.device_name));
    result
}

fn desired_ports(hardware: &HardwareInfo) -> Vec<AttachedPort> {
    // Keyed by MAC; a malformed host config that reuses one MAC across
    // interfaces collapses to the last occurrence.
    let mut by_mac: HashMap<&str, AttachedPort> = HashMap::new();
    for interface in &hardware.interfaces {
        if interface.mac.is_empty() {
            continue;
        }
        if by_mac.contains_key(interface.mac.as_str()) {
            warn!(mac = %interface.mac, "duplicate MAC address in domain definition");
        }
        by_mac.insert(
            interface.mac.as_str(),
            AttachedPort {
                mac_address: interface.mac.clone(),
                model_name: interface.model.clone(),
                device_name: interface.device.clone(),
                bridge_name: interface.bridge.clone(),
            },
        );
    }

    let mut result: Vec<AttachedPort> = by_mac.into_values().collect();
    result.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
    result
}

fn desired_graphics(info: GraphicsInfo) -> Vec<String> {
    let mut kinds = Vec::new();
    if info.spice {
        kinds.push("spice".to_string());
    }
    if info.vnc {
        kinds.push("vnc".to_string());
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database;
    use crate::driver::mock::{MockDomain, MockHypervisor};
    use crate::driver::{DiskInfo, DomainState, InterfaceInfo};
    use crate::model::hosts::{self, NewHost};

    async fn test_db(host_ids: &[&str]) -> SqlitePool {
        let db = database::connect_in_memory().await.unwrap();
        for id in host_ids {
            hosts::add(
                &db,
                &NewHost {
                    id: id.to_string(),
                    uri: "qemu:///system".to_string(),
                },
            )
            .await
            .unwrap();
        }
        db
    }

    fn driver_with(domains: Vec<MockDomain>) -> Arc<dyn Hypervisor> {
        let handle = MockHypervisor::new();
        for domain in domains {
            handle.insert(domain);
        }
        handle
    }

    fn full_domain(name: &str, uuid: Uuid) -> MockDomain {
        let mut domain = MockDomain::new(name, uuid, DomainState::Active);
        domain.hardware = HardwareInfo {
            disks: vec![DiskInfo {
                device: "vda".to_string(),
                bus: "virtio".to_string(),
                format: "qcow2".to_string(),
                path: format!("/var/lib/libvirt/images/{name}.qcow2"),
            }],
            interfaces: vec![InterfaceInfo {
                mac: "52:54:00:aa:bb:cc".to_string(),
                bridge: "br0".to_string(),
                model: "virtio".to_string(),
                device: "vnet0".to_string(),
            }],
        };
        domain.info.graphics = GraphicsInfo {
            vnc: true,
            spice: false,
        };
        domain
    }

    async fn count(db: &SqlitePool, sql: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(sql).fetch_one(db).await.unwrap();
        row.0
    }

    #[tokio::test]
    async fn new_domain_is_inserted_with_its_domain_uuid_as_identity() {
        let db = test_db(&["h1"]).await;
        let uuid = Uuid::new_v4();
        let driver = driver_with(vec![MockDomain::new("vm1", uuid, DomainState::Active)]);

        let changed = reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();
        assert!(changed);

        let mut conn = db.acquire().await.unwrap();
        let row = vms::by_host_and_name(&mut conn, "h1", "vm1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.domain_uuid, uuid.to_string());
        assert_eq!(row.internal_uuid, uuid.to_string());
        assert_eq!(row.state, DomainState::Active);
    }

    #[tokio::test]
    async fn reconciling_an_unchanged_domain_is_a_no_op() {
        let db = test_db(&["h1"]).await;
        let driver = driver_with(vec![full_domain("vm1", Uuid::new_v4())]);

        assert!(reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        assert!(!reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        assert!(!reconcile_host(&db, &driver, "h1").await.unwrap());
    }

    #[tokio::test]
    async fn state_change_updates_the_row() {
        let db = test_db(&["h1"]).await;
        let uuid = Uuid::new_v4();
        let handle = MockHypervisor::new();
        handle.insert(MockDomain::new("vm1", uuid, DomainState::Active));
        let driver: Arc<dyn Hypervisor> = handle.clone();

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();
        handle.set_state("vm1", DomainState::Stopped);

        assert!(reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        let mut conn = db.acquire().await.unwrap();
        let row = vms::by_host_and_name(&mut conn, "h1", "vm1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, DomainState::Stopped);
    }

    #[tokio::test]
    async fn vanished_domain_is_deleted_from_the_cache() {
        let db = test_db(&["h1"]).await;
        let handle = MockHypervisor::new();
        handle.insert(MockDomain::new("vm1", Uuid::new_v4(), DomainState::Active));
        let driver: Arc<dyn Hypervisor> = handle.clone();

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();
        handle.remove("vm1");

        assert!(reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM virtual_machines").await, 0);

        // And again, now that nothing is cached.
        assert!(!reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
    }

    #[tokio::test]
    async fn cross_host_uuid_conflict_mints_a_fresh_internal_uuid() {
        let db = test_db(&["a", "b"]).await;
        let shared = Uuid::new_v4();

        let driver_a = driver_with(vec![MockDomain::new("d", shared, DomainState::Active)]);
        let driver_b = driver_with(vec![MockDomain::new("d2", shared, DomainState::Active)]);

        reconcile_host(&db, &driver_a, "a").await.unwrap();
        reconcile_host(&db, &driver_b, "b").await.unwrap();

        let mut conn = db.acquire().await.unwrap();
        let row_a = vms::by_host_and_name(&mut conn, "a", "d")
            .await
            .unwrap()
            .unwrap();
        let row_b = vms::by_host_and_name(&mut conn, "b", "d2")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row_a.internal_uuid, shared.to_string());
        assert_eq!(row_b.domain_uuid, shared.to_string());
        assert_ne!(row_b.internal_uuid, row_a.internal_uuid);
    }

    #[tokio::test]
    async fn hardware_sync_yields_one_row_per_attachment_kind() {
        let db = test_db(&["h1"]).await;
        let driver = driver_with(vec![full_domain("vm1", Uuid::new_v4())]);

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM volume_attachments").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM port_bindings").await, 1);
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM graphics_device_attachments").await,
            1
        );
    }

    #[tokio::test]
    async fn repeated_sync_keeps_a_single_port_row_per_mac() {
        let db = test_db(&["h1"]).await;
        let driver = driver_with(vec![full_domain("vm1", Uuid::new_v4())]);

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();
        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        let mut conn = db.acquire().await.unwrap();
        assert_eq!(
            networks::port_count_by_mac(&mut conn, "52:54:00:aa:bb:cc")
                .await
                .unwrap(),
            1
        );
        drop(conn);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM port_bindings").await, 1);
    }

    #[tokio::test]
    async fn hardware_drift_is_detected_without_vm_field_changes() {
        let db = test_db(&["h1"]).await;
        let handle = MockHypervisor::new();
        handle.insert(full_domain("vm1", Uuid::new_v4()));
        let driver: Arc<dyn Hypervisor> = handle.clone();

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        handle.update("vm1", |domain| {
            domain.hardware.disks.push(DiskInfo {
                device: "vdb".to_string(),
                bus: "virtio".to_string(),
                format: "raw".to_string(),
                path: "/dev/vg0/extra".to_string(),
            });
        });

        assert!(reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM volume_attachments").await, 2);
    }

    #[tokio::test]
    async fn reconcile_host_prunes_rows_missing_from_the_live_set() {
        let db = test_db(&["h1"]).await;
        let handle = MockHypervisor::new();
        handle.insert(MockDomain::new("vm1", Uuid::new_v4(), DomainState::Active));
        handle.insert(MockDomain::new("vm2", Uuid::new_v4(), DomainState::Stopped));
        let driver: Arc<dyn Hypervisor> = handle.clone();

        reconcile_host(&db, &driver, "h1").await.unwrap();
        assert_eq!(count(&db, "SELECT COUNT(*) FROM virtual_machines").await, 2);

        handle.remove("vm2");
        assert!(reconcile_host(&db, &driver, "h1").await.unwrap());

        let mut conn = db.acquire().await.unwrap();
        let remaining = vms::list_by_host_tx(&mut conn, "h1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "vm1");
    }

    #[tokio::test]
    async fn host_deletion_cascades_to_every_owned_row() {
        let db = test_db(&["h1"]).await;
        let driver = driver_with(vec![full_domain("vm1", Uuid::new_v4())]);
        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        let mut tx = db.begin().await.unwrap();
        hosts::delete(&mut tx, "h1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM virtual_machines").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM volume_attachments").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM ports").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM port_bindings").await, 0);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM networks").await, 0);
        assert_eq!(
            count(&db, "SELECT COUNT(*) FROM graphics_device_attachments").await,
            0
        );
    }

    #[tokio::test]
    async fn recreated_domain_with_same_name_replaces_the_stale_row() {
        let db = test_db(&["h1"]).await;
        let handle = MockHypervisor::new();
        handle.insert(MockDomain::new("vm1", Uuid::new_v4(), DomainState::Active));
        let driver: Arc<dyn Hypervisor> = handle.clone();

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        // Same name, fresh hypervisor UUID.
        let new_uuid = Uuid::new_v4();
        handle.remove("vm1");
        handle.insert(MockDomain::new("vm1", new_uuid, DomainState::Active));

        assert!(reconcile_one(&db, &driver, "h1", "vm1").await.unwrap());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM virtual_machines").await, 1);

        let mut conn = db.acquire().await.unwrap();
        let row = vms::by_host_and_name(&mut conn, "h1", "vm1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.domain_uuid, new_uuid.to_string());
    }

    #[tokio::test]
    async fn duplicate_macs_collapse_to_the_last_interface() {
        let db = test_db(&["h1"]).await;
        let mut domain = full_domain("vm1", Uuid::new_v4());
        domain.hardware.interfaces.push(InterfaceInfo {
            mac: "52:54:00:aa:bb:cc".to_string(),
            bridge: "br1".to_string(),
            model: "e1000".to_string(),
            device: "vnet9".to_string(),
        });
        let driver = driver_with(vec![domain]);

        reconcile_one(&db, &driver, "h1", "vm1").await.unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM ports").await, 1);
        let mut conn = db.acquire().await.unwrap();
        let ports = networks::attached_to_vm(&mut conn, 1).await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].bridge_name, "br1");
    }
}
