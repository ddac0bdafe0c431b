use crate::{App, driver::DriverError, errors::Error, pool::PoolError};
use axum::{
    Extension, Json, Router,
    body::Body,
    response::{self, IntoResponse, Response},
    routing::{delete, get, post},
};
use http::{Request, StatusCode, header::HeaderName};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod console;
mod host;
mod vm;
mod ws;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[derive(OpenApi)]
#[openapi(
    paths(
        host::handler::list,
        host::handler::add,
        host::handler::remove,
        host::handler::info,
        vm::handler::list,
        vm::handler::stats,
        vm::handler::hardware,
        vm::handler::lifecycle,
    ),
    components(
        schemas(
            crate::model::hosts::Host,
            crate::model::hosts::NewHost,
            crate::model::vms::VmView,
            crate::model::volumes::AttachedVolume,
            crate::model::networks::AttachedPort,
            crate::service::VmHardware,
            crate::driver::DomainState,
            crate::driver::GraphicsInfo,
            crate::driver::HostInfo,
            crate::driver::IoCounters,
            crate::driver::VmSample,
        )
    ),
    tags(
        (name = "hosts", description = "Hypervisor host management"),
        (name = "vms", description = "Virtual machine inventory and lifecycle")
    ),
    info(
        title = "Virtumancer API",
        version = "0.1.0",
        description = "REST and WebSocket API for managing libvirt hosts and their VMs"
    )
)]
pub struct ApiDoc;

pub fn app(env: App) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    let api = Router::new()
        .route("/health", get(health))
        .route("/hosts", get(host::handler::list).post(host::handler::add))
        .route("/hosts/{host_id}", delete(host::handler::remove))
        .route("/hosts/{host_id}/info", get(host::handler::info))
        .route("/hosts/{host_id}/vms", get(vm::handler::list))
        .route(
            "/hosts/{host_id}/vms/{vm_name}/stats",
            get(vm::handler::stats),
        )
        .route(
            "/hosts/{host_id}/vms/{vm_name}/hardware",
            get(vm::handler::hardware),
        )
        .route(
            "/hosts/{host_id}/vms/{vm_name}/{verb}",
            post(vm::handler::lifecycle),
        )
        .route(
            "/hosts/{host_id}/vms/{vm_name}/console",
            get(console::handler::vnc),
        )
        .route(
            "/hosts/{host_id}/vms/{vm_name}/spice",
            get(console::handler::spice),
        )
        .route("/ws", get(ws::handler::upgrade));

    Router::new()
        .nest("/api/v1", api)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
                .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|value| value.header_value().to_str().unwrap_or_default())
                            .unwrap_or_default();

                        tracing::info_span!(
                            "HTTP",
                            http.method = %request.method(),
                            http.url = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                ),
        )
        .layer(Extension(env))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

pub struct ApiResponse<T> {
    data: T,
    code: StatusCode,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            data,
            code: StatusCode::OK,
        }
    }

    pub fn created(data: T) -> Self {
        ApiResponse {
            data,
            code: StatusCode::CREATED,
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Send + Sync + Serialize,
{
    fn into_response(self) -> Response {
        let mut response = response::Json(self.data).into_response();
        *response.status_mut() = self.code;
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorResponse {
            message: String,
        }

        tracing::error!("API error: {:?}", self);
        (
            self.status_code(),
            Json(ErrorResponse {
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidEntity(_) => StatusCode::BAD_REQUEST,
            Error::Driver(driver) | Error::Pool(PoolError::Driver(driver)) => {
                match driver {
                    // Config problems are the caller's to fix.
                    DriverError::UnsupportedScheme(_) | DriverError::InvalidUri(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                }
            }
            Error::Pool(PoolError::AlreadyConnected(_)) | Error::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Error::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Sqlx(_) | Error::Pool(PoolError::NotConnected(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
