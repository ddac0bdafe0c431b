use serde::Serialize;
use sqlx::SqliteConnection;
use utoipa::ToSchema;
use uuid::Uuid;

/// A port joined through its binding, for the hardware endpoint and the
/// reconciler's drift check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow, ToSchema)]
pub struct AttachedPort {
    pub mac_address: String,
    pub model_name: String,
    pub device_name: String,
    pub bridge_name: String,
}

/// Networks are identified by a UUID derived deterministically from
/// `(host_id, bridge_name)`, so reconciling the same bridge twice lands on
/// the same row.
pub fn network_uuid(host_id: &str, bridge_name: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{host_id}/{bridge_name}").as_bytes(),
    )
}

pub async fn upsert_network(
    conn: &mut SqliteConnection,
    host_id: &str,
    bridge_name: &str,
) -> Result<i64, sqlx::Error> {
    let uuid = network_uuid(host_id, bridge_name).to_string();
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO networks (host_id, uuid, bridge_name) VALUES (?, ?, ?)
         ON CONFLICT(uuid) DO UPDATE SET bridge_name = excluded.bridge_name
         RETURNING id",
    )
    .bind(host_id)
    .bind(uuid)
    .bind(bridge_name)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

/// Ports are keyed by MAC and may migrate between VMs; an upsert re-links
/// the row to its current owner.
pub async fn upsert_port(
    conn: &mut SqliteConnection,
    vm_id: i64,
    mac_address: &str,
    model_name: &str,
    device_name: &str,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO ports (vm_id, mac_address, model_name, device_name) VALUES (?, ?, ?, ?)
         ON CONFLICT(mac_address) DO UPDATE SET
             vm_id = excluded.vm_id,
             model_name = excluded.model_name,
             device_name = excluded.device_name
         RETURNING id",
    )
    .bind(vm_id)
    .bind(mac_address)
    .bind(model_name)
    .bind(device_name)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

pub async fn ensure_binding(
    conn: &mut SqliteConnection,
    port_id: i64,
    network_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO port_bindings (port_id, network_id) VALUES (?, ?)")
        .bind(port_id)
        .bind(network_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drops the bindings of every port this VM owns. The ports themselves stay:
/// they are keyed by MAC and may recur on the next sync.
pub async fn unbind_vm_ports(conn: &mut SqliteConnection, vm_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM port_bindings
         WHERE port_id IN (SELECT id FROM ports WHERE vm_id = ?)",
    )
    .bind(vm_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn attached_to_vm(
    conn: &mut SqliteConnection,
    vm_id: i64,
) -> Result<Vec<AttachedPort>, sqlx::Error> {
    sqlx::query_as::<_, AttachedPort>(
        "SELECT p.mac_address, p.model_name, p.device_name, n.bridge_name
         FROM ports p
         JOIN port_bindings b ON b.port_id = p.id
         JOIN networks n ON n.id = b.network_id
         WHERE p.vm_id = ?
         ORDER BY p.mac_address",
    )
    .bind(vm_id)
    .fetch_all(conn)
    .await
}

/// Removes every network the host owns. Bindings referencing them cascade.
pub async fn delete_by_host(
    conn: &mut SqliteConnection,
    host_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM networks WHERE host_id = ?")
        .bind(host_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn port_count_by_mac(
    conn: &mut SqliteConnection,
    mac_address: &str,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ports WHERE mac_address = ?")
        .bind(mac_address)
        .fetch_one(conn)
        .await?;
    Ok(row.0)
}
