use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use futures_util::StreamExt;
use log::{info, warn};
use warp::ws::WebSocket;
use warp::Filter;

use crate::broadcaster::Broadcaster;
use crate::config::{Config, SessionLimits};
use crate::registry::Registry;
use crate::session::Session;

/// Owns the registry and broadcaster and hands each connection a session.
#[derive(Clone)]
pub struct Server {
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    limits: SessionLimits,
}

impl Server {
    pub fn new(limits: SessionLimits) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        Server {
            registry,
            broadcaster,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let (ws_tx, ws_rx) = ws.split();
        Session::serve(
            Arc::clone(&self.registry),
            self.broadcaster.clone(),
            ws_rx,
            ws_tx,
            self.limits,
        )
        .await;
    }

    /// `GET /ws` upgraded to a websocket, one session per connection.
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = self.clone();
        warp::path("ws")
            .and(warp::path::end())
            .and(warp::ws())
            .map(move |ws: warp::ws::Ws| {
                let server = server.clone();
                ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket).await;
                })
            })
            .with(warp::cors().allow_any_origin())
    }

    /// Bind `addr` and serve until `shutdown` resolves. Returns the bound
    /// address (useful with port 0) and the server future.
    pub fn bind<S>(
        &self,
        addr: SocketAddr,
        shutdown: S,
    ) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let shutdown = async move {
            shutdown.await;
            registry.close_all().await;
        };
        warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)
    }

    /// Serve with the given config, over TLS when the certificate and key
    /// load, otherwise plain.
    pub async fn run<S>(self, config: &Config, shutdown: S) -> Result<(), warp::Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        if tls_files_usable(&config.tls_cert, &config.tls_key) {
            let registry = Arc::clone(&self.registry);
            let shutdown = async move {
                shutdown.await;
                registry.close_all().await;
            };
            let (addr, serving) = warp::serve(self.routes())
                .tls()
                .cert_path(&config.tls_cert)
                .key_path(&config.tls_key)
                .bind_with_graceful_shutdown(config.addr, shutdown);
            info!("Starting secure server (WSS) on {}", addr);
            serving.await;
        } else {
            let (addr, serving) = self.bind(config.addr, shutdown)?;
            info!("Starting server (WS) on {}", addr);
            serving.await;
        }
        info!("Server stopped");
        Ok(())
    }
}

/// Whether both PEM files exist and contain a certificate and a PKCS#8 key.
fn tls_files_usable(cert_path: &Path, key_path: &Path) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open certificate file {}: {}", cert_path.display(), e);
            return false;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open private key file {}: {}", key_path.display(), e);
            return false;
        }
    };

    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect();
    match certs {
        Ok(certs) if !certs.is_empty() => {}
        Ok(_) => {
            warn!("No certificate found in {}", cert_path.display());
            return false;
        }
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return false;
        }
    }

    match rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file)).next() {
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            warn!("Failed to parse private key: {}", e);
            false
        }
        None => {
            warn!("No PKCS#8 private key found in {}", key_path.display());
            false
        }
    }
}
