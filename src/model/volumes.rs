use serde::Serialize;
use sqlx::SqliteConnection;
use utoipa::ToSchema;

/// A volume joined through its attachment, as the hardware endpoint and the
/// reconciler's drift check consume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow, ToSchema)]
pub struct AttachedVolume {
    pub path: String,
    pub format: String,
    pub device_name: String,
    pub bus_type: String,
}

/// Volumes are keyed by backing path; re-attaching an existing path reuses
/// the row.
pub async fn upsert(
    conn: &mut SqliteConnection,
    path: &str,
    format: &str,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO volumes (path, format) VALUES (?, ?)
         ON CONFLICT(path) DO UPDATE SET format = excluded.format
         RETURNING id",
    )
    .bind(path)
    .bind(format)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

pub async fn attach(
    conn: &mut SqliteConnection,
    vm_id: i64,
    volume_id: i64,
    device_name: &str,
    bus_type: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO volume_attachments (vm_id, volume_id, device_name, bus_type)
         VALUES (?, ?, ?, ?)",
    )
    .bind(vm_id)
    .bind(volume_id)
    .bind(device_name)
    .bind(bus_type)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn detach_all(conn: &mut SqliteConnection, vm_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM volume_attachments WHERE vm_id = ?")
        .bind(vm_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn attached_to_vm(
    conn: &mut SqliteConnection,
    vm_id: i64,
) -> Result<Vec<AttachedVolume>, sqlx::Error> {
    sqlx::query_as::<_, AttachedVolume>(
        "SELECT v.path, v.format, a.device_name, a.bus_type
         FROM volume_attachments a
         JOIN volumes v ON v.id = a.volume_id
         WHERE a.vm_id = ?
         ORDER BY a.device_name",
    )
    .bind(vm_id)
    .fetch_all(conn)
    .await
}
