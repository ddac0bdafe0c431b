//! Graphical console relay.
//!
//! Splices a browser WebSocket onto the TCP endpoint a VM's VNC or SPICE
//! server listens on. The relay is opaque: inbound binary and text frames
//! are flattened into the byte stream, outbound bytes always leave as
//! binary frames. Nothing in the VNC/SPICE protocol is interpreted here.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::driver::{GraphicsKind, uri};
use crate::model::hosts;
use crate::pool::ConnectionPool;

/// Addresses a hypervisor reports when the graphics server binds locally or
/// on every interface; none of them is reachable from a browser.
const LOCAL_LISTENS: &[&str] = &["", "127.0.0.1", "0.0.0.0", "::"];

pub async fn relay(
    socket: WebSocket,
    db: SqlitePool,
    pool: Arc<ConnectionPool>,
    host_id: String,
    vm_name: String,
    kind: GraphicsKind,
) {
    let target = match resolve_target(&db, &pool, &host_id, &vm_name, kind).await {
        Some(target) => target,
        None => return,
    };

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%target, %error, "failed to connect to console endpoint");
            return;
        }
    };

    info!(host = %host_id, vm = %vm_name, %kind, %target, "console relay open");
    splice(socket, stream).await;
    info!(host = %host_id, vm = %vm_name, %kind, "console relay closed");
}

async fn resolve_target(
    db: &SqlitePool,
    pool: &ConnectionPool,
    host_id: &str,
    vm_name: &str,
    kind: GraphicsKind,
) -> Option<String> {
    let driver = match pool.get(host_id).await {
        Ok(driver) => driver,
        Err(error) => {
            warn!(host = host_id, %error, "console request for unconnected host");
            return None;
        }
    };

    let domain = match driver.lookup_domain(vm_name).await {
        Ok(domain) => domain,
        Err(error) => {
            warn!(host = host_id, vm = vm_name, %error, "console request for unknown VM");
            return None;
        }
    };

    let endpoints = match driver.graphics(&domain).await {
        Ok(endpoints) => endpoints,
        Err(error) => {
            warn!(host = host_id, vm = vm_name, %error, "failed to read graphics config");
            return None;
        }
    };

    let endpoint = endpoints.into_iter().find(|e| e.kind == kind)?;

    // SPICE prefers the TLS port when one is bound. The relay still dials
    // plain TCP; deployments that enforce TLS terminate it elsewhere.
    let port = match kind {
        GraphicsKind::Vnc => endpoint.port,
        GraphicsKind::Spice => endpoint.tls_port.or(endpoint.port),
    };
    let Some(port) = port else {
        warn!(host = host_id, vm = vm_name, %kind, "no usable console port");
        return None;
    };

    let listen = endpoint.listen.unwrap_or_default();
    let address = if LOCAL_LISTENS.contains(&listen.as_str()) {
        let host = match hosts::get(db, host_id).await {
            Ok(Some(host)) => host,
            _ => {
                warn!(host = host_id, "host row missing while resolving console address");
                return None;
            }
        };
        match uri::reachable_host(&host.uri) {
            Some(address) => {
                debug!(host = host_id, %address, "resolved local listen address to hypervisor");
                address
            }
            None => {
                warn!(host = host_id, uri = %host.uri, "cannot derive console address from URI");
                return None;
            }
        }
    } else {
        listen
    };

    Some(format!("{address}:{port}"))
}

/// Pumps bytes both ways until either side closes, then drops both ends so
/// the other direction unblocks.
async fn splice(socket: WebSocket, stream: TcpStream) {
    let (mut sink, mut ws_stream) = socket.split();
    let (mut tcp_read, mut tcp_write) = stream.into_split();

    let client_to_target = async {
        while let Some(Ok(message)) = ws_stream.next().await {
            let payload = match message {
                Message::Binary(bytes) => bytes,
                // Some clients send handshake bytes as text frames.
                Message::Text(text) => text.as_bytes().to_vec().into(),
                Message::Close(_) => break,
                _ => continue,
            };
            if tcp_write.write_all(&payload).await.is_err() {
                break;
            }
        }
        let _ = tcp_write.shutdown().await;
    };

    let target_to_client = async {
        let mut buffer = [0u8; 8192];
        loop {
            match tcp_read.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sink
                        .send(Message::Binary(buffer[..n].to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    };

    tokio::select! {
        _ = client_to_target => {}
        _ = target_to_client => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database;
    use crate::driver::mock::{MockConnector, MockDomain, MockHypervisor};
    use crate::driver::{DomainState, GraphicsEndpoint};
    use crate::model::hosts::NewHost;
    use uuid::Uuid;

    #[test]
    fn local_listen_addresses_are_recognized() {
        for listen in ["", "127.0.0.1", "0.0.0.0", "::"] {
            assert!(LOCAL_LISTENS.contains(&listen));
        }
        assert!(!LOCAL_LISTENS.contains(&"192.0.2.10"));
    }

    async fn setup(endpoints: Vec<GraphicsEndpoint>) -> (SqlitePool, Arc<ConnectionPool>) {
        let db = database::connect_in_memory().await.unwrap();
        hosts::add(
            &db,
            &NewHost {
                id: "h1".to_string(),
                uri: "qemu+ssh://root@kvm1.example/system".to_string(),
            },
        )
        .await
        .unwrap();

        let connector = MockConnector::new();
        let handle = MockHypervisor::new();
        let mut domain = MockDomain::new("vm1", Uuid::new_v4(), DomainState::Active);
        domain.graphics = endpoints;
        handle.insert(domain);
        connector.register("qemu+ssh://root@kvm1.example/system", handle);

        let pool = Arc::new(ConnectionPool::new(connector));
        pool.add("h1", "qemu+ssh://root@kvm1.example/system")
            .await
            .unwrap();
        (db, pool)
    }

    #[tokio::test]
    async fn wildcard_listen_resolves_to_the_hypervisor_address() {
        let (db, pool) = setup(vec![GraphicsEndpoint {
            kind: GraphicsKind::Vnc,
            port: Some(5901),
            tls_port: None,
            listen: Some("0.0.0.0".to_string()),
        }])
        .await;

        let target = resolve_target(&db, &pool, "h1", "vm1", GraphicsKind::Vnc).await;
        assert_eq!(target.as_deref(), Some("kvm1.example:5901"));
    }

    #[tokio::test]
    async fn explicit_listen_address_is_used_verbatim() {
        let (db, pool) = setup(vec![GraphicsEndpoint {
            kind: GraphicsKind::Vnc,
            port: Some(5900),
            tls_port: None,
            listen: Some("192.0.2.10".to_string()),
        }])
        .await;

        let target = resolve_target(&db, &pool, "h1", "vm1", GraphicsKind::Vnc).await;
        assert_eq!(target.as_deref(), Some("192.0.2.10:5900"));
    }

    #[tokio::test]
    async fn spice_prefers_the_tls_port() {
        let (db, pool) = setup(vec![GraphicsEndpoint {
            kind: GraphicsKind::Spice,
            port: Some(5930),
            tls_port: Some(5931),
            listen: Some("192.0.2.10".to_string()),
        }])
        .await;

        let target = resolve_target(&db, &pool, "h1", "vm1", GraphicsKind::Spice).await;
        assert_eq!(target.as_deref(), Some("192.0.2.10:5931"));
    }

    #[tokio::test]
    async fn unbound_port_yields_no_target() {
        let (db, pool) = setup(vec![GraphicsEndpoint {
            kind: GraphicsKind::Vnc,
            port: None,
            tls_port: None,
            listen: None,
        }])
        .await;

        assert!(
            resolve_target(&db, &pool, "h1", "vm1", GraphicsKind::Vnc)
                .await
                .is_none()
        );
    }
}
