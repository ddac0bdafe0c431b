use std::sync::Arc;

use axum::{Extension, extract::WebSocketUpgrade, response::IntoResponse};

use crate::{App, session};

pub async fn upgrade(ws: WebSocketUpgrade, Extension(env): Extension<App>) -> impl IntoResponse {
    let bus = Arc::clone(env.service().bus());
    let subscriptions = Arc::clone(env.service().subscriptions());
    ws.on_upgrade(move |socket| session::run(socket, bus, subscriptions))
}
