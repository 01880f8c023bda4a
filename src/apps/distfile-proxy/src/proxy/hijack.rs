//! Takes CONNECT tunnels away from the plain HTTP server.
//!
//! hyper writes the `200` for a CONNECT request before it releases the
//! socket, so the hand-off runs on its own task once the upgrade completes.
//! From then on the [`ConnectionSink`] alone owns the connection.

use super::bridge::ListenerBridge;
use super::utils::{ProxyError, ProxyResult};
use crate::mirror::body::{self, MirrorBody};

use async_trait::async_trait;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A raw client connection detached from the HTTP server, together with the
/// CONNECT request that opened it.
pub struct HijackedConnection {
    pub io: TokioIo<Upgraded>,
    pub request: Request<()>,
}

impl std::fmt::Debug for HijackedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConnection")
            .field("target", self.request.uri())
            .finish_non_exhaustive()
    }
}

/// Takes ownership of hijacked connections.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn hand_off(&self, conn: HijackedConnection);
}

#[async_trait]
impl ConnectionSink for ListenerBridge<HijackedConnection> {
    async fn hand_off(&self, conn: HijackedConnection) {
        if let Err(rejected) = self.push(conn).await {
            // Dropping the connection closes the client's socket.
            warn!(
                "Closing tunnel to {}: {}",
                rejected.conn.request.uri(),
                rejected.reason
            );
        }
    }
}

/// Answers ordinary requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle<B: Send + 'static>(&self, req: Request<B>) -> Response<MirrorBody>;
}

/// Sends CONNECT requests' connections to `sink` and every other request to
/// `delegate`.
pub struct ConnectionHijacker<S, D> {
    sink: Arc<S>,
    delegate: Arc<D>,
}

impl<S, D> ConnectionHijacker<S, D>
where
    S: ConnectionSink + 'static,
    D: RequestHandler,
{
    pub fn new(sink: Arc<S>, delegate: Arc<D>) -> Self {
        Self { sink, delegate }
    }

    pub async fn handle<B: Send + 'static>(&self, mut req: Request<B>) -> Response<MirrorBody> {
        if req.method() != Method::CONNECT {
            return self.delegate.handle(req).await;
        }

        debug!("Hijacking CONNECT {}", req.uri());
        match self.hijack(&mut req) {
            Ok(()) => {
                let mut response = Response::new(body::empty());
                *response.status_mut() = StatusCode::OK;
                response
            }
            Err(e) => {
                error!("CONNECT {} failed: {}", req.uri(), e);
                body::text_response(e.status(), &e.to_string())
            }
        }
    }

    fn hijack<B>(&self, req: &mut Request<B>) -> ProxyResult<()> {
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::HijackUnsupported)?;
        let head = request_head(req);
        let sink = self.sink.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!("Hijacked connection for {}", head.uri());
                    sink.hand_off(HijackedConnection {
                        io: TokioIo::new(upgraded),
                        request: head,
                    })
                    .await;
                }
                // The 200 is already on the wire, so this can only be logged.
                Err(e) => warn!("CONNECT {}: {}", head.uri(), ProxyError::HijackIo(e)),
            }
        });
        Ok(())
    }
}

fn request_head<B>(req: &Request<B>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = req.method().clone();
    *head.uri_mut() = req.uri().clone();
    *head.version_mut() = req.version();
    *head.headers_mut() = req.headers().clone();
    head
}
