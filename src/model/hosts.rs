use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use utoipa::ToSchema;
use validator::Validate;

/// A registered hypervisor host. The id is operator-chosen and doubles as
/// the primary key.
#[derive(Serialize, Deserialize, Debug, Clone, sqlx::FromRow, ToSchema)]
pub struct Host {
    pub id: String,
    pub uri: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Validate, ToSchema)]
pub struct NewHost {
    #[validate(length(min = 1, max = 255))]
    pub id: String,

    #[validate(length(min = 1))]
    pub uri: String,
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Host>, sqlx::Error> {
    sqlx::query_as::<_, Host>("SELECT id, uri FROM hosts ORDER BY id")
        .fetch_all(pool)
        .await
}

pub async fn get(pool: &SqlitePool, host_id: &str) -> Result<Option<Host>, sqlx::Error> {
    sqlx::query_as::<_, Host>("SELECT id, uri FROM hosts WHERE id = ?")
        .bind(host_id)
        .fetch_optional(pool)
        .await
}

pub async fn add(pool: &SqlitePool, host: &NewHost) -> Result<Host, sqlx::Error> {
    sqlx::query("INSERT INTO hosts (id, uri) VALUES (?, ?)")
        .bind(&host.id)
        .bind(&host.uri)
        .execute(pool)
        .await?;

    Ok(Host {
        id: host.id.clone(),
        uri: host.uri.clone(),
    })
}

pub async fn delete(conn: &mut SqliteConnection, host_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM hosts WHERE id = ?")
        .bind(host_id)
        .execute(conn)
        .await?;
    Ok(())
}
