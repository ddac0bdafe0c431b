use crate::handlers::{ApiResponse, Result};
use crate::{
    App,
    driver::VmSample,
    model::vms::VmView,
    service::{LifecycleAction, VmHardware},
};
use axum::{Extension, extract::Path};
use http::StatusCode;
use tracing::instrument;

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/vms",
    params(("host_id" = String, Path, description = "Host identifier")),
    responses(
        (status = 200, description = "Cached VM list; a background sync runs after", body = Vec<VmView>),
        (status = 500, description = "Internal server error")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn list(
    Extension(env): Extension<App>,
    Path(host_id): Path<String>,
) -> Result<ApiResponse<Vec<VmView>>> {
    let vms = env.service().list_vms(&host_id).await?;
    Ok(ApiResponse::ok(vms))
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/vms/{vm_name}/stats",
    params(
        ("host_id" = String, Path, description = "Host identifier"),
        ("vm_name" = String, Path, description = "Domain name")
    ),
    responses(
        (status = 200, description = "Latest counter sample", body = VmSample),
        (status = 500, description = "Host not connected or RPC failure")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn stats(
    Extension(env): Extension<App>,
    Path((host_id, vm_name)): Path<(String, String)>,
) -> Result<ApiResponse<VmSample>> {
    let sample = env.service().vm_stats(&host_id, &vm_name).await?;
    Ok(ApiResponse::ok(sample))
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/vms/{vm_name}/hardware",
    params(
        ("host_id" = String, Path, description = "Host identifier"),
        ("vm_name" = String, Path, description = "Domain name")
    ),
    responses(
        (status = 200, description = "Normalized hardware from the cache", body = VmHardware),
        (status = 404, description = "VM not in the cache"),
        (status = 500, description = "Internal server error")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn hardware(
    Extension(env): Extension<App>,
    Path((host_id, vm_name)): Path<(String, String)>,
) -> Result<ApiResponse<VmHardware>> {
    let hardware = env.service().vm_hardware(&host_id, &vm_name).await?;
    Ok(ApiResponse::ok(hardware))
}

#[utoipa::path(
    post,
    path = "/api/v1/hosts/{host_id}/vms/{vm_name}/{verb}",
    params(
        ("host_id" = String, Path, description = "Host identifier"),
        ("vm_name" = String, Path, description = "Domain name"),
        ("verb" = String, Path, description = "start | shutdown | reboot | forceoff | forcereset")
    ),
    responses(
        (status = 204, description = "Verb executed, cache reconciled"),
        (status = 422, description = "Unknown verb"),
        (status = 500, description = "RPC failure")
    ),
    tag = "vms"
)]
#[instrument(skip(env))]
pub async fn lifecycle(
    Extension(env): Extension<App>,
    Path((host_id, vm_name, verb)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    let action: LifecycleAction = verb.parse()?;
    env.service().lifecycle(&host_id, &vm_name, action).await?;
    Ok(StatusCode::NO_CONTENT)
}
