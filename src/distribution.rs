//! Distributed control channel: listener and distributor.
//!
//! Cooperating instances exchange batch submissions over plain HTTP. The
//! listener accepts submissions on one or more local addresses, decodes each
//! body as a [`BatchSpec`] and hands it to the registered [`BatchHandler`] on
//! its own task; the distributor pushes a serialized batch to a set of peer
//! endpoints, fire-and-forget. A failure on one connection or one endpoint
//! never affects the others.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::codec::{self, CodecError};
use crate::payload::BatchSpec;

/// Fixed plaintext acknowledgement written to every accepted submission.
pub const ACK_BODY: &str = "ok";

/// Receives batch submissions accepted by the listener.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn on_batch(&self, batch: BatchSpec, requester: String);
}

struct ListenerState {
    shutdown: watch::Sender<bool>,
    addrs: Vec<SocketAddr>,
}

/// Control-plane HTTP listener.
///
/// One hyper server per bound address, all sharing a shutdown signal.
/// Accepted connections are served concurrently by hyper; handler dispatch is
/// spawned so a slow or panicking handler cannot stall the accept loop or the
/// acknowledgement.
pub struct DistributionListener {
    handler: Arc<dyn BatchHandler>,
    listening: AtomicBool,
    inner: Mutex<Option<ListenerState>>,
}

impl DistributionListener {
    pub fn new(handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            handler,
            listening: AtomicBool::new(false),
            inner: Mutex::new(None),
        }
    }

    /// Binds the given `address:port` strings and starts serving.
    ///
    /// Returns false when already listening or when no address could be
    /// bound. Must be called from within a tokio runtime. Port 0 is
    /// supported; see [`Self::local_addrs`] for the resolved ports.
    pub fn start(&self, addresses: &[String]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            warn!("Control listener already running");
            return false;
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut addrs = Vec::new();

        for address in addresses {
            let addr: SocketAddr = match address.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(address = %address, error = %e, "Unparseable listen address");
                    continue;
                }
            };

            let builder = match Server::try_bind(&addr) {
                Ok(builder) => builder,
                Err(e) => {
                    warn!(address = %addr, error = %e, "Could not bind listen address");
                    continue;
                }
            };

            let handler = self.handler.clone();
            let make_svc = make_service_fn(move |conn: &AddrStream| {
                let handler = handler.clone();
                let remote = conn.remote_addr();
                async move {
                    Ok::<_, hyper::Error>(service_fn(move |req| {
                        let handler = handler.clone();
                        async move { handle_submission(req, handler, remote).await }
                    }))
                }
            });

            let server = builder.serve(make_svc);
            let bound = server.local_addr();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let graceful = server.with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                if let Err(e) = graceful.await {
                    error!(error = %e, "Control listener error");
                }
            });
            info!(addr = %bound, "Control listener started");
            addrs.push(bound);
        }

        if addrs.is_empty() {
            return false;
        }

        self.listening.store(true, Ordering::SeqCst);
        *inner = Some(ListenerState {
            shutdown: shutdown_tx,
            addrs,
        });
        true
    }

    /// Signals the accept loops to exit. Connections already accepted are
    /// allowed to finish.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.take() {
            let _ = state.shutdown.send(true);
            self.listening.store(false, Ordering::SeqCst);
            info!("Control listener stopping");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Addresses actually bound, with resolved ports.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|state| state.addrs.clone())
            .unwrap_or_default()
    }
}

async fn handle_submission(
    req: Request<Body>,
    handler: Arc<dyn BatchHandler>,
    remote: SocketAddr,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;

    if !body.is_empty() {
        match std::str::from_utf8(&body) {
            Ok(document) => match codec::from_xml(document) {
                Ok(batch) => {
                    info!(requester = %remote, batch = %batch.name, "Batch submission received");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.on_batch(batch, remote.to_string()).await;
                    });
                }
                Err(e) => {
                    warn!(requester = %remote, error = %e, "Undecodable batch submission")
                }
            },
            Err(e) => warn!(requester = %remote, error = %e, "Non-UTF-8 submission body"),
        }
    }

    Ok(Response::new(Body::from(ACK_BODY)))
}

/// A delivery that could not reach its endpoint.
#[derive(Debug, Clone)]
pub struct DistributionFailure {
    pub endpoint: String,
    pub message: String,
}

/// Pushes batch submissions to peer endpoints.
///
/// The batch is serialized once; each endpoint is attempted regardless of
/// earlier failures. No retries, and nothing of the response is consumed
/// beyond the transport outcome.
pub struct Distributor {
    client: reqwest::Client,
}

impl Distributor {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub async fn distribute(
        &self,
        batch: &BatchSpec,
        endpoints: &[String],
    ) -> Result<Vec<DistributionFailure>, CodecError> {
        let payload = codec::to_xml(batch)?;
        let mut failures = Vec::new();

        for endpoint in endpoints {
            match self
                .client
                .post(endpoint)
                .header("Content-Type", "text/xml")
                .body(payload.clone())
                .send()
                .await
            {
                Ok(response) => {
                    info!(
                        endpoint = %endpoint,
                        status = response.status().as_u16(),
                        batch = %batch.name,
                        "Batch distributed"
                    );
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, batch = %batch.name, "Batch distribution failed");
                    failures.push(DistributionFailure {
                        endpoint: endpoint.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(failures)
    }
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new()
    }
}
