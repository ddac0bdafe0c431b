use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use utoipa::ToSchema;

use crate::driver::{DomainState, GraphicsInfo};

/// Cached VM row. `internal_uuid` is the service-wide identity; it equals
/// `domain_uuid` unless the same domain UUID already lives on another host.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VirtualMachine {
    pub id: i64,
    pub host_id: String,
    pub name: String,
    pub internal_uuid: String,
    pub domain_uuid: String,
    pub description: String,
    pub state: DomainState,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
}

/// What the VM list endpoint returns: cache fields plus the cached console
/// capability flags, no live driver call involved.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VmView {
    pub db_id: i64,
    pub name: String,
    pub description: String,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
    pub state: DomainState,
    pub graphics: GraphicsInfo,
}

/// Field set the reconciler writes.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub host_id: String,
    pub name: String,
    pub internal_uuid: String,
    pub domain_uuid: String,
    pub state: DomainState,
    pub vcpu_count: i64,
    pub memory_bytes: i64,
}

pub async fn list_by_host(
    pool: &SqlitePool,
    host_id: &str,
) -> Result<Vec<VirtualMachine>, sqlx::Error> {
    sqlx::query_as::<_, VirtualMachine>(
        "SELECT id, host_id, name, internal_uuid, domain_uuid, description, state,
                vcpu_count, memory_bytes
         FROM virtual_machines WHERE host_id = ? ORDER BY name",
    )
    .bind(host_id)
    .fetch_all(pool)
    .await
}

pub async fn list_by_host_tx(
    conn: &mut SqliteConnection,
    host_id: &str,
) -> Result<Vec<VirtualMachine>, sqlx::Error> {
    sqlx::query_as::<_, VirtualMachine>(
        "SELECT id, host_id, name, internal_uuid, domain_uuid, description, state,
                vcpu_count, memory_bytes
         FROM virtual_machines WHERE host_id = ? ORDER BY name",
    )
    .bind(host_id)
    .fetch_all(conn)
    .await
}

pub async fn by_host_and_name(
    conn: &mut SqliteConnection,
    host_id: &str,
    name: &str,
) -> Result<Option<VirtualMachine>, sqlx::Error> {
    sqlx::query_as::<_, VirtualMachine>(
        "SELECT id, host_id, name, internal_uuid, domain_uuid, description, state,
                vcpu_count, memory_bytes
         FROM virtual_machines WHERE host_id = ? AND name = ?",
    )
    .bind(host_id)
    .bind(name)
    .fetch_optional(conn)
    .await
}

pub async fn by_host_and_domain_uuid(
    conn: &mut SqliteConnection,
    host_id: &str,
    domain_uuid: &str,
) -> Result<Option<VirtualMachine>, sqlx::Error> {
    sqlx::query_as::<_, VirtualMachine>(
        "SELECT id, host_id, name, internal_uuid, domain_uuid, description, state,
                vcpu_count, memory_bytes
         FROM virtual_machines WHERE host_id = ? AND domain_uuid = ?",
    )
    .bind(host_id)
    .bind(domain_uuid)
    .fetch_optional(conn)
    .await
}

/// True when any *other* host already caches this domain UUID (the
/// cross-host clone/restore case).
pub async fn domain_uuid_on_other_host(
    conn: &mut SqliteConnection,
    host_id: &str,
    domain_uuid: &str,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM virtual_machines WHERE domain_uuid = ? AND host_id != ? LIMIT 1",
    )
    .bind(domain_uuid)
    .bind(host_id)
    .fetch_optional(conn)
    .await?;
    Ok(row.is_some())
}

pub async fn insert(conn: &mut SqliteConnection, vm: &VmRecord) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO virtual_machines
             (host_id, name, internal_uuid, domain_uuid, description, state,
              vcpu_count, memory_bytes)
         VALUES (?, ?, ?, ?, '', ?, ?, ?)
         RETURNING id",
    )
    .bind(&vm.host_id)
    .bind(&vm.name)
    .bind(&vm.internal_uuid)
    .bind(&vm.domain_uuid)
    .bind(vm.state)
    .bind(vm.vcpu_count)
    .bind(vm.memory_bytes)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

pub async fn update_live_fields(
    conn: &mut SqliteConnection,
    id: i64,
    name: &str,
    state: DomainState,
    vcpu_count: i64,
    memory_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE virtual_machines SET name = ?, state = ?, vcpu_count = ?, memory_bytes = ?
         WHERE id = ?",
    )
    .bind(name)
    .bind(state)
    .bind(vcpu_count)
    .bind(memory_bytes)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn delete_by_host(
    conn: &mut SqliteConnection,
    host_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM virtual_machines WHERE host_id = ?")
        .bind(host_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}
