//! HTTP server bootstrap: bind, accept, route, graceful shutdown.
//!
//! A hand-rolled routing loop on raw hyper, dispatching by method and path
//! rather than pulling in a web framework.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

use crate::remote::MasterLookup;
use crate::store::Store;

use super::admin;
use super::read::{self, ReadRequest};

type Body = Full<Bytes>;

/// Runs the HTTP read surface until `Ctrl-C`/SIGTERM, or forever if no
/// shutdown signal can be installed.
pub async fn serve(store: Arc<Store>, master: Option<Arc<dyn MasterLookup>>, addr: SocketAddr) -> crate::errors::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "volume server listening");

    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let store = store.clone();
                let master = master.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle(req, store.clone(), master.clone()));
                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle(
    req: Request<Incoming>,
    store: Arc<Store>,
    master: Option<Arc<dyn MasterLookup>>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let headers = req.headers().clone();

    let response = tokio::task::spawn_blocking(move || {
        route(&store, master.as_deref(), &method, &path, &query, &headers)
    })
    .await
    .unwrap_or_else(|_| {
        Response::builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::new(Bytes::new()))
            .unwrap()
    });

    Ok(response)
}

fn route(
    store: &Store,
    master: Option<&dyn MasterLookup>,
    method: &http::Method,
    path: &str,
    query: &str,
    headers: &http::HeaderMap,
) -> Response<Body> {
    match path {
        "/admin/sync/status" => admin::sync_status(store, query),
        "/admin/sync/index" => admin::index_content(store, query),
        "/admin/sync/data" => admin::data_content(store, query),
        "/admin/sync/vol_data" => admin::vol_data(store, query, headers.get("range").and_then(|v| v.to_str().ok())),
        "/admin/needle" => admin::get_needle(store, query),
        _ => read::handle(
            store,
            master,
            ReadRequest { method: method.clone(), path, query, headers },
        ),
    }
}
