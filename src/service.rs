//! The control-plane facade the HTTP layer talks to.
//!
//! Reads come from the cache and return fast; mutations go to the driver,
//! then reconcile the cache and publish events so every connected UI
//! converges. The hypervisor stays authoritative for state, the cache for
//! UI reads.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{error, info, warn};
use validator::Validate;

use crate::driver::{GraphicsInfo, HostInfo, VmSample, uri};
use crate::errors::Error;
use crate::events::{Event, EventBus};
use crate::model::hosts::{self, Host, NewHost};
use crate::model::vms::{self, VmView};
use crate::model::{graphics, networks, volumes};
use crate::pool::ConnectionPool;
use crate::reconciler;
use crate::subscriptions::SubscriptionManager;

/// Lifecycle verbs accepted by the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Shutdown,
    Reboot,
    ForceOff,
    ForceReset,
}

impl FromStr for LifecycleAction {
    type Err = Error;

    fn from_str(verb: &str) -> Result<Self, Self::Err> {
        match verb {
            "start" => Ok(LifecycleAction::Start),
            "shutdown" => Ok(LifecycleAction::Shutdown),
            "reboot" => Ok(LifecycleAction::Reboot),
            "forceoff" => Ok(LifecycleAction::ForceOff),
            "forcereset" => Ok(LifecycleAction::ForceReset),
            other => Err(Error::UnprocessableEntity(format!(
                "unknown lifecycle verb '{other}'"
            ))),
        }
    }
}

/// Hardware view assembled from the normalized cache rows.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct VmHardware {
    pub disks: Vec<volumes::AttachedVolume>,
    pub networks: Vec<networks::AttachedPort>,
}

pub struct HostService {
    db: SqlitePool,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    subscriptions: Arc<SubscriptionManager>,
}

impl HostService {
    pub fn new(
        db: SqlitePool,
        pool: Arc<ConnectionPool>,
        bus: Arc<EventBus>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Arc<Self> {
        Arc::new(HostService {
            db,
            pool,
            bus,
            subscriptions,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    // --- Hosts ---

    pub async fn list_hosts(&self) -> Result<Vec<Host>, Error> {
        Ok(hosts::list(&self.db).await?)
    }

    /// Persists the host, then connects. A malformed URI is rejected before
    /// anything is written; a failed connect rolls the row back so a bad
    /// host leaves no trace either way.
    pub async fn add_host(self: &Arc<Self>, new_host: NewHost) -> Result<Host, Error> {
        new_host.validate()?;
        uri::parse(&new_host.uri)?;

        let host = hosts::add(&self.db, &new_host).await.map_err(|err| {
            if is_unique_violation(&err) {
                Error::Conflict(format!("host '{}' already exists", new_host.id))
            } else {
                Error::from(err)
            }
        })?;

        if let Err(error) = self.pool.add(&host.id, &host.uri).await {
            let mut tx = self.db.begin().await?;
            if let Err(rollback_err) = hosts::delete(&mut tx, &host.id).await {
                error!(host = %host.id, %rollback_err, "failed to roll back host row after connect failure");
            }
            tx.commit().await?;
            return Err(error.into());
        }

        self.spawn_host_reconcile(host.id.clone());
        self.bus.publish(&Event::HostsChanged);
        Ok(host)
    }

    /// Disconnect is best-effort; the row and everything it owns go away
    /// regardless.
    pub async fn remove_host(&self, host_id: &str) -> Result<(), Error> {
        if let Err(error) = self.pool.remove(host_id).await {
            warn!(host = host_id, %error, "disconnect failed during host removal");
        }

        let mut tx = self.db.begin().await?;
        let removed = vms::delete_by_host(&mut tx, host_id).await?;
        networks::delete_by_host(&mut tx, host_id).await?;
        hosts::delete(&mut tx, host_id).await?;
        tx.commit().await?;

        info!(host = host_id, vms = removed, "host removed");
        self.bus.publish(&Event::HostsChanged);
        Ok(())
    }

    /// Live host facts, never cached.
    pub async fn host_info(&self, host_id: &str) -> Result<HostInfo, Error> {
        let driver = self.pool.get(host_id).await?;
        Ok(driver.host_info().await?)
    }

    /// Dials every stored host. Individual failures are logged; startup
    /// carries on.
    pub async fn connect_stored_hosts(self: &Arc<Self>) {
        let stored = match hosts::list(&self.db).await {
            Ok(stored) => stored,
            Err(error) => {
                error!(%error, "could not load stored hosts");
                return;
            }
        };

        for host in stored {
            info!(host = %host.id, "connecting to stored host");
            match self.pool.add(&host.id, &host.uri).await {
                Ok(()) => self.spawn_host_reconcile(host.id.clone()),
                Err(error) => {
                    warn!(host = %host.id, uri = %host.uri, %error, "failed to connect to stored host");
                }
            }
        }
    }

    // --- VMs ---

    /// Cached VM list for fast rendering; kicks off a background sync that
    /// publishes `vms-changed` when the cache moved.
    pub async fn list_vms(self: &Arc<Self>, host_id: &str) -> Result<Vec<VmView>, Error> {
        let rows = vms::list_by_host(&self.db, host_id).await?;

        let mut views = Vec::with_capacity(rows.len());
        let mut conn = self.db.acquire().await?;
        for row in rows {
            let kinds = graphics::kinds_for_vm(&mut conn, row.id).await?;
            views.push(VmView {
                db_id: row.id,
                name: row.name,
                description: row.description,
                vcpu_count: row.vcpu_count,
                memory_bytes: row.memory_bytes,
                state: row.state,
                graphics: GraphicsInfo {
                    vnc: kinds.iter().any(|kind| kind == "vnc"),
                    spice: kinds.iter().any(|kind| kind == "spice"),
                },
            });
        }
        drop(conn);

        self.spawn_host_reconcile(host_id.to_string());
        Ok(views)
    }

    /// Prefers the latest sample of an active poller; otherwise one driver
    /// round trip.
    pub async fn vm_stats(&self, host_id: &str, vm_name: &str) -> Result<VmSample, Error> {
        if let Some(sample) = self.subscriptions.last_known(host_id, vm_name) {
            return Ok(sample);
        }

        let driver = self.pool.get(host_id).await?;
        let domain = driver.lookup_domain(vm_name).await?;
        Ok(driver.stats(&domain).await?)
    }

    /// Reconciles the VM first, then serves its normalized hardware from
    /// the cache.
    pub async fn vm_hardware(&self, host_id: &str, vm_name: &str) -> Result<VmHardware, Error> {
        let driver = self.pool.get(host_id).await?;
        if reconciler::reconcile_one(&self.db, &driver, host_id, vm_name).await? {
            self.bus.publish(&Event::VmsChanged {
                host_id: host_id.to_string(),
            });
        }

        let mut conn = self.db.acquire().await?;
        let row = vms::by_host_and_name(&mut conn, host_id, vm_name)
            .await?
            .ok_or(Error::NotFound)?;

        Ok(VmHardware {
            disks: volumes::attached_to_vm(&mut conn, row.id).await?,
            networks: networks::attached_to_vm(&mut conn, row.id).await?,
        })
    }

    pub async fn lifecycle(
        &self,
        host_id: &str,
        vm_name: &str,
        action: LifecycleAction,
    ) -> Result<(), Error> {
        let driver = self.pool.get(host_id).await?;
        let domain = driver.lookup_domain(vm_name).await?;

        match action {
            LifecycleAction::Start => driver.start(&domain).await?,
            LifecycleAction::Shutdown => driver.shutdown(&domain).await?,
            LifecycleAction::Reboot => driver.reboot(&domain).await?,
            LifecycleAction::ForceOff => driver.destroy(&domain).await?,
            LifecycleAction::ForceReset => driver.reset(&domain).await?,
        }

        if reconciler::reconcile_one(&self.db, &driver, host_id, vm_name).await? {
            self.bus.publish(&Event::VmsChanged {
                host_id: host_id.to_string(),
            });
        }
        Ok(())
    }

    fn spawn_host_reconcile(self: &Arc<Self>, host_id: String) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let driver = match service.pool.get(&host_id).await {
                Ok(driver) => driver,
                Err(error) => {
                    warn!(host = %host_id, %error, "skipping sync for unconnected host");
                    return;
                }
            };

            match reconciler::reconcile_host(&service.db, &driver, &host_id).await {
                Ok(true) => {
                    service.bus.publish(&Event::VmsChanged { host_id });
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(host = %host_id, %error, "background sync failed");
                }
            }
        });
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database;
    use crate::driver::mock::{MockConnector, MockDomain, MockHypervisor};
    use crate::driver::Connector;
    use uuid::Uuid;

    struct Fixture {
        service: Arc<HostService>,
        connector: Arc<MockConnector>,
        bus: Arc<EventBus>,
    }

    async fn fixture() -> Fixture {
        let db = database::connect_in_memory().await.unwrap();
        let connector = MockConnector::new();
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector) as Arc<dyn Connector>
        ));
        let bus = Arc::new(EventBus::new());
        let subscriptions = SubscriptionManager::new(Arc::clone(&pool), Arc::clone(&bus));
        let service = HostService::new(db, pool, Arc::clone(&bus), subscriptions);
        Fixture {
            service,
            connector,
            bus,
        }
    }

    fn host_with_vm(fixture: &Fixture, uri: &str, vm: &str) -> Arc<MockHypervisor> {
        let handle = MockHypervisor::new();
        handle.insert(MockDomain::new(vm, Uuid::new_v4(), crate::driver::DomainState::Active));
        fixture.connector.register(uri, Arc::clone(&handle));
        handle
    }

    #[tokio::test]
    async fn add_host_persists_connects_and_publishes() {
        let fixture = fixture().await;
        host_with_vm(&fixture, "qemu:///system", "vm1");
        let (_client, mut rx) = fixture.bus.register();

        let host = fixture
            .service
            .add_host(NewHost {
                id: "h1".to_string(),
                uri: "qemu:///system".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(host.id, "h1");
        assert_eq!(fixture.service.pool().len().await, 1);
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"hosts-changed"}"#);
    }

    #[tokio::test]
    async fn add_host_rolls_back_when_connect_fails() {
        let fixture = fixture().await;

        let result = fixture
            .service
            .add_host(NewHost {
                id: "h1".to_string(),
                uri: "qemu:///unreachable".to_string(),
            })
            .await;

        assert!(result.is_err());
        assert!(fixture.service.list_hosts().await.unwrap().is_empty());
        assert_eq!(fixture.service.pool().len().await, 0);
    }

    #[tokio::test]
    async fn add_host_rejects_a_malformed_uri_before_persisting() {
        let fixture = fixture().await;

        let result = fixture
            .service
            .add_host(NewHost {
                id: "h1".to_string(),
                uri: "xen://kvm1.example/system".to_string(),
            })
            .await;

        assert!(matches!(
            result,
            Err(Error::Driver(crate::driver::DriverError::UnsupportedScheme(_)))
        ));
        // Rejected up front, not written and rolled back.
        assert!(fixture.service.list_hosts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_host_rejects_duplicate_ids() {
        let fixture = fixture().await;
        host_with_vm(&fixture, "qemu:///system", "vm1");

        let new_host = NewHost {
            id: "h1".to_string(),
            uri: "qemu:///system".to_string(),
        };
        fixture.service.add_host(new_host.clone()).await.unwrap();

        assert!(matches!(
            fixture.service.add_host(new_host).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn remove_host_leaves_no_rows_behind() {
        let fixture = fixture().await;
        let handle = host_with_vm(&fixture, "qemu:///system", "vm1");

        // Register the host without add_host so no background sync races
        // the assertions below.
        hosts::add(
            fixture.service.db(),
            &NewHost {
                id: "h1".to_string(),
                uri: "qemu:///system".to_string(),
            },
        )
        .await
        .unwrap();
        fixture.service.pool().add("h1", "qemu:///system").await.unwrap();

        let driver = fixture.service.pool().get("h1").await.unwrap();
        reconciler::reconcile_host(fixture.service.db(), &driver, "h1")
            .await
            .unwrap();

        fixture.service.remove_host("h1").await.unwrap();

        assert!(fixture.service.list_hosts().await.unwrap().is_empty());
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM virtual_machines")
            .fetch_one(fixture.service.db())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
        assert!(handle.disconnected.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn lifecycle_runs_the_verb_and_updates_the_cache() {
        let fixture = fixture().await;
        let handle = host_with_vm(&fixture, "qemu:///system", "vm1");

        hosts::add(
            fixture.service.db(),
            &NewHost {
                id: "h1".to_string(),
                uri: "qemu:///system".to_string(),
            },
        )
        .await
        .unwrap();
        fixture.service.pool().add("h1", "qemu:///system").await.unwrap();

        fixture
            .service
            .lifecycle("h1", "vm1", LifecycleAction::ForceOff)
            .await
            .unwrap();

        assert_eq!(
            handle.verbs.lock().unwrap().as_slice(),
            &[("destroy".to_string(), "vm1".to_string())]
        );

        let mut conn = fixture.service.db().acquire().await.unwrap();
        let row = vms::by_host_and_name(&mut conn, "h1", "vm1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, crate::driver::DomainState::Stopped);
    }

    #[tokio::test]
    async fn vm_stats_falls_back_to_a_one_shot_driver_call() {
        let fixture = fixture().await;
        host_with_vm(&fixture, "qemu:///system", "vm1");

        fixture
            .service
            .add_host(NewHost {
                id: "h1".to_string(),
                uri: "qemu:///system".to_string(),
            })
            .await
            .unwrap();

        let sample = fixture.service.vm_stats("h1", "vm1").await.unwrap();
        assert_eq!(sample.state, crate::driver::DomainState::Active);
    }

    #[test]
    fn lifecycle_verbs_parse_from_their_url_form() {
        assert_eq!(
            "forceoff".parse::<LifecycleAction>().unwrap(),
            LifecycleAction::ForceOff
        );
        assert!("suspend".parse::<LifecycleAction>().is_err());
    }
}
