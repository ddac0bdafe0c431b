use sqlx::SqliteConnection;

/// Graphics devices are shared rows keyed by protocol kind ("vnc", "spice");
/// per-VM presence lives in the attachment table.
pub async fn upsert_device(conn: &mut SqliteConnection, kind: &str) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO graphics_devices (kind) VALUES (?)
         ON CONFLICT(kind) DO UPDATE SET kind = excluded.kind
         RETURNING id",
    )
    .bind(kind)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

pub async fn attach(
    conn: &mut SqliteConnection,
    vm_id: i64,
    graphics_device_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO graphics_device_attachments (vm_id, graphics_device_id) VALUES (?, ?)",
    )
    .bind(vm_id)
    .bind(graphics_device_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn detach_all(conn: &mut SqliteConnection, vm_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM graphics_device_attachments WHERE vm_id = ?")
        .bind(vm_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn kinds_for_vm(
    conn: &mut SqliteConnection,
    vm_id: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT d.kind
         FROM graphics_device_attachments a
         JOIN graphics_devices d ON d.id = a.graphics_device_id
         WHERE a.vm_id = ?
         ORDER BY d.kind",
    )
    .bind(vm_id)
    .fetch_all(conn)
    .await?;
    Ok(rows.into_iter().map(|(kind,)| kind).collect())
}
