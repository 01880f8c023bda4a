use crate::blob::BlobStore;
use crate::cert::CertificateIssuer;
use crate::config::{AppConfig, DEFAULT_HTTP_BIND_ADDR};
use crate::db::MetadataStore;
use crate::mirror::{MirrorChain, RegistryPatterns};

use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use std::convert::Infallible;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hyper_util::server::conn::auto::Builder as AutoServer;
use hyper_util::{rt::TokioExecutor, rt::TokioIo};

pub mod bridge;
pub mod hijack;
mod utils;

pub use bridge::{BridgeConfig, BridgeError, ListenerBridge, OverflowPolicy};
pub use hijack::{ConnectionHijacker, ConnectionSink, HijackedConnection, RequestHandler};
pub use utils::{ProxyError, ProxyResult, build_server_tls, is_closed};


type Hijacker = ConnectionHijacker<ListenerBridge<HijackedConnection>, MirrorChain>;

/// The plain HTTP listener and the TLS server fed by its CONNECT tunnels.
///
/// Requests on the plain listener are answered by an `http` mirror chain.
/// CONNECT tunnels are pushed onto a [`ListenerBridge`], decrypted with a
/// certificate minted for the client's SNI and answered by an `https` chain.
#[derive(Clone)]
pub struct ProxyServer {
    listen_addr: Option<SocketAddr>,
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<AppConfig>,
    bridge: Arc<ListenerBridge<HijackedConnection>>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        config: AppConfig,
    ) -> Self {
        let bridge = ListenerBridge::new(config.proxy.bridge());
        Self {
            listen_addr: None,
            issuer,
            store,
            blobs,
            config: Arc::new(config),
            bridge: Arc::new(bridge),
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the actual bound listen address, if the server has been started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Binds the plain HTTP listener and spawns both accept loops.
    /// Returns immediately once the listener is bound.
    pub async fn start(&mut self) -> ProxyResult<()> {
        let patterns = Arc::new(
            RegistryPatterns::new()
                .map_err(|e| ProxyError::Generic(format!("invalid registry pattern: {}", e)))?,
        );
        let verify_buffer_limit = self.config.files.verify_buffer_limit;
        let http_chain = Arc::new(MirrorChain::mirrors(
            "http",
            self.store.clone(),
            self.blobs.clone(),
            patterns.clone(),
            verify_buffer_limit,
        ));
        let https_chain = Arc::new(MirrorChain::mirrors(
            "https",
            self.store.clone(),
            self.blobs.clone(),
            patterns,
            verify_buffer_limit,
        ));
        let acceptor = TlsAcceptor::from(Arc::new(build_server_tls(self.issuer.clone())?));

        let bind_addr = self
            .config
            .proxy
            .http_bind_addr
            .as_deref()
            .unwrap_or(DEFAULT_HTTP_BIND_ADDR);
        let listener = TcpListener::bind(bind_addr).await?;
        let listen_addr = listener.local_addr()?;
        self.listen_addr = Some(listen_addr);
        info!("Proxy listening on {}", listen_addr);

        tokio::spawn(serve_bridged_tls(
            self.bridge.clone(),
            acceptor,
            https_chain,
            self.shutdown.clone(),
        ));

        let hijacker = Arc::new(ConnectionHijacker::new(self.bridge.clone(), http_chain));
        tokio::spawn(serve_plain_http(listener, hijacker, self.shutdown.clone()));

        Ok(())
    }

    /// Resolves once [`ProxyServer::shutdown`] has been called.
    pub async fn join(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stops both accept loops and closes the bridge. Connections already
    /// being served run to completion.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.bridge.close().await;
    }
}

async fn serve_plain_http(
    listener: TcpListener,
    hijacker: Arc<Hijacker>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((io, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let hijacker = hijacker.clone();
                        tokio::spawn(async move {
                            let svc = service_fn(move |req: Request<Incoming>| {
                                let hijacker = hijacker.clone();
                                async move { Ok::<_, Infallible>(hijacker.handle(req).await) }
                            });

                            if let Err(e) = http1::Builder::new()
                                .preserve_header_case(true)
                                .title_case_headers(true)
                                .serve_connection(TokioIo::new(io), svc)
                                .with_upgrades()
                                .await
                            {
                                if is_closed(&e) {
                                    debug!("client closed: {}", e);
                                } else {
                                    error!("conn error: {}", e);
                                }
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
        }
    }
    debug!("Plain HTTP accept loop stopped");
}

async fn serve_bridged_tls(
    bridge: Arc<ListenerBridge<HijackedConnection>>,
    acceptor: TlsAcceptor,
    chain: Arc<MirrorChain>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = bridge.accept() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("Bridged TLS listener stopping: {}", e);
                    break;
                }
            },
        };

        let acceptor = acceptor.clone();
        let chain = chain.clone();
        tokio::spawn(async move {
            let target = conn.request.uri().to_string();
            if let Err(e) = serve_tls_connection(acceptor, conn, chain).await {
                match &e {
                    ProxyError::Io(ioe) if is_closed(ioe) => debug!("tls tunnel closed"),
                    _ => warn!("TLS connection for {} failed: {}", target, e),
                }
            }
        });
    }
    debug!("Bridged TLS accept loop stopped");
}

/// Terminates TLS on one bridged connection, then serves it with a hyper
/// auto (h1 or h2) server. The certificate is minted during the handshake,
/// on this connection's task.
async fn serve_tls_connection(
    acceptor: TlsAcceptor,
    conn: HijackedConnection,
    chain: Arc<MirrorChain>,
) -> ProxyResult<()> {
    let target = conn.request.uri().to_string();
    let tls = acceptor.accept(conn.io).await?;
    debug!("TLS established with client for {}", target);

    let svc = service_fn(move |req: Request<Incoming>| {
        let chain = chain.clone();
        async move { Ok::<_, Infallible>(chain.handle(req).await) }
    });

    let auto: AutoServer<TokioExecutor> = AutoServer::new(TokioExecutor::new());
    if let Err(e) = auto.serve_connection(TokioIo::new(tls), svc).await {
        if is_closed(&e) {
            debug!("TLS connection closed: {}", e);
        } else {
            warn!("TLS connection error: {}", e);
        }
    }

    Ok(())
}
