use crate::handlers::{ApiResponse, Result};
use crate::{
    App,
    driver::HostInfo,
    model::hosts::{Host, NewHost},
};
use axum::{Extension, Json, extract::Path};
use http::StatusCode;
use tracing::instrument;

#[utoipa::path(
    get,
    path = "/api/v1/hosts",
    responses(
        (status = 200, description = "List all registered hosts", body = Vec<Host>),
        (status = 500, description = "Internal server error")
    ),
    tag = "hosts"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<Host>>> {
    let hosts = env.service().list_hosts().await?;
    Ok(ApiResponse::ok(hosts))
}

#[utoipa::path(
    post,
    path = "/api/v1/hosts",
    request_body = NewHost,
    responses(
        (status = 201, description = "Host registered and connected", body = Host),
        (status = 400, description = "Invalid id or URI"),
        (status = 409, description = "Host id already exists"),
        (status = 500, description = "Persistence or connection failure")
    ),
    tag = "hosts"
)]
#[instrument(skip(env, host), fields(host_id = %host.id))]
pub async fn add(
    Extension(env): Extension<App>,
    Json(host): Json<NewHost>,
) -> Result<ApiResponse<Host>> {
    let host = env.service().add_host(host).await?;
    Ok(ApiResponse::created(host))
}

#[utoipa::path(
    delete,
    path = "/api/v1/hosts/{host_id}",
    params(("host_id" = String, Path, description = "Host identifier")),
    responses(
        (status = 204, description = "Host removed"),
        (status = 500, description = "Internal server error")
    ),
    tag = "hosts"
)]
#[instrument(skip(env))]
pub async fn remove(
    Extension(env): Extension<App>,
    Path(host_id): Path<String>,
) -> Result<StatusCode> {
    env.service().remove_host(&host_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/info",
    params(("host_id" = String, Path, description = "Host identifier")),
    responses(
        (status = 200, description = "Live hypervisor facts", body = HostInfo),
        (status = 500, description = "Host not connected or RPC failure")
    ),
    tag = "hosts"
)]
#[instrument(skip(env))]
pub async fn info(
    Extension(env): Extension<App>,
    Path(host_id): Path<String>,
) -> Result<ApiResponse<HostInfo>> {
    let info = env.service().host_info(&host_id).await?;
    Ok(ApiResponse::ok(info))
}
