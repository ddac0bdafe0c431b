use std::sync::Arc;

use axum::{
    Extension,
    extract::{Path, WebSocketUpgrade},
    response::IntoResponse,
};

use crate::{App, console, driver::GraphicsKind};

/// noVNC and spice-html5 both speak raw bytes over the `binary`
/// subprotocol; the relay rejects nothing else but advertises only that.
pub async fn vnc(
    ws: WebSocketUpgrade,
    Extension(env): Extension<App>,
    Path((host_id, vm_name)): Path<(String, String)>,
) -> impl IntoResponse {
    serve(ws, env, host_id, vm_name, GraphicsKind::Vnc)
}

pub async fn spice(
    ws: WebSocketUpgrade,
    Extension(env): Extension<App>,
    Path((host_id, vm_name)): Path<(String, String)>,
) -> impl IntoResponse {
    serve(ws, env, host_id, vm_name, GraphicsKind::Spice)
}

fn serve(
    ws: WebSocketUpgrade,
    env: App,
    host_id: String,
    vm_name: String,
    kind: GraphicsKind,
) -> impl IntoResponse {
    let db = env.service().db().clone();
    let pool = Arc::clone(env.service().pool());
    ws.protocols(["binary"])
        .on_upgrade(move |socket| console::relay(socket, db, pool, host_id, vm_name, kind))
}
