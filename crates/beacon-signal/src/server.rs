//! WebSocket signal server implementation
//!
//! One TCP listener carries both surfaces. Each accepted stream is served
//! as HTTP/1.1 with a deadline on the request head; upgrade requests on any
//! path become peer connections, everything else goes to the HTTP router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use beacon_core::{Config, LivenessConfig, MAX_MESSAGE_SIZE};

use crate::credentials::CredentialStore;
use crate::http::{self, HttpState};
use crate::messages::{InboundEvent, ServerMessage};
use crate::registry::{PeerHandle, PeerMailbox, PeerSnapshot, RelayAddr, Registry};
use crate::router;
use crate::sweeper::{IdleSweeper, PeerCloser};

/// Connection-lifecycle side of the server: the only place peers are closed
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<Registry>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Drop a peer that was never announced, without telling anyone
    pub fn discard(&self, peer_id: &str) -> bool {
        match self.registry.remove(peer_id) {
            Some(peer) => {
                peer.handle().close();
                true
            }
            None => false,
        }
    }
}

impl PeerCloser for Gateway {
    fn close_peer(&self, peer_id: &str) -> bool {
        let Some(peer) = self.registry.remove(peer_id) else {
            return false;
        };

        peer.handle().close();
        let notified = router::broadcast(
            &self.registry,
            &ServerMessage::PeerLeft {
                peer_id: peer_id.to_owned(),
            },
            None,
        );

        info!(
            "Peer {} left after {:?} ({} peers notified)",
            peer_id,
            peer.connected_at.elapsed(),
            notified
        );
        true
    }
}

/// State shared by every peer connection task
struct Shared {
    gateway: Gateway,
    outbound_queue: usize,
}

/// Signal server state
pub struct SignalServer {
    shared: Arc<Shared>,
    app: Router,
    liveness: LivenessConfig,
    head_timeout: Duration,
}

impl SignalServer {
    pub fn new(config: &Config, credentials: CredentialStore) -> Self {
        let registry = Arc::new(Registry::new());
        let shared = Arc::new(Shared {
            gateway: Gateway::new(registry.clone()),
            outbound_queue: config.liveness.outbound_queue,
        });

        let http_state = HttpState {
            registry,
            credentials: Arc::new(credentials),
            liveness_window: config.liveness.idle_timeout(),
        };
        let app = http::router(http_state, &config.http)
            .layer(middleware::from_fn_with_state(shared.clone(), accept_peers));

        Self {
            shared,
            app,
            liveness: config.liveness.clone(),
            head_timeout: config.http.head_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.shared.gateway.registry()
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.registry().len()
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        let sweeper = IdleSweeper::new(
            self.registry().clone(),
            Arc::new(self.shared.gateway.clone()),
            self.liveness.idle_timeout(),
            self.liveness.sweep_interval(),
        )
        .spawn();

        let result = self.accept_loop(&listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let app = self.app.clone();
            let head_timeout = self.head_timeout;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, app, head_timeout).await {
                    debug!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Serve one TCP connection (HTTP or WebSocket)
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    app: Router,
    head_timeout: Duration,
) -> Result<(), hyper::Error> {
    let service = service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer_addr));
        app.clone().oneshot(request)
    });

    // A client that never finishes its request head is dropped
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(head_timeout);

    builder
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Take over upgrade requests before they reach the HTTP routes
async fn accept_peers(
    State(shared): State<Arc<Shared>>,
    request: Request,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return next.run(request).await;
    }

    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let Some(ConnectInfo(origin)) = parts.extensions.get::<ConnectInfo<SocketAddr>>().copied()
    else {
        warn!("Upgrade request without a peer address");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let relay_addr = parts
        .uri
        .query()
        .and_then(|query| relay_addr_from_query(query, origin));

    upgrade
        .max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| run_peer(socket, origin, relay_addr, shared))
}

/// `?relayPort=N[&relayHost=H]` on the upgrade URL advertises a relay address
fn relay_addr_from_query(query: &str, origin: SocketAddr) -> Option<RelayAddr> {
    let param = |name: &str| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };

    let port = param("relayPort")?
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)?;
    let host = param("relayHost")
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| origin.ip().to_string());
    Some(RelayAddr { host, port })
}

/// Drive one registered peer until it closes, errors, or is evicted
async fn run_peer(
    socket: WebSocket,
    origin: SocketAddr,
    relay_addr: Option<RelayAddr>,
    shared: Arc<Shared>,
) {
    let registry = shared.gateway.registry();
    let (handle, mailbox) = PeerHandle::channel(shared.outbound_queue);

    let peer_id = match registry.register(handle, origin, relay_addr) {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting connection from {}: {}", origin, e);
            return;
        }
    };
    info!("Peer {} connected from {}", peer_id, origin);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Written directly so it precedes anything already queued for this peer
    let welcome = ServerMessage::Welcome {
        peer_id: peer_id.clone(),
        peers: registry
            .list()
            .iter()
            .filter(|p| p.id != peer_id)
            .map(PeerSnapshot::summary)
            .collect(),
    };
    let welcomed = match welcome.to_json() {
        Ok(json) => ws_sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode welcome for {}: {}", peer_id, e);
            false
        }
    };

    if !welcomed {
        shared.gateway.discard(&peer_id);
        debug!("Peer {} dropped before welcome", peer_id);
        return;
    }

    router::broadcast(
        registry,
        &ServerMessage::NewPeer {
            peer_id: peer_id.clone(),
        },
        Some(&peer_id),
    );

    let PeerMailbox { mut rx, shutdown } = mailbox;
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("Closing connection for {}", peer_id);
                break;
            }

            Some(text) = rx.recv() => {
                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                    debug!("Send to {} failed: {:?}", peer_id, e);
                    break;
                }
            }

            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        registry.touch(&peer_id);
                        match InboundEvent::parse(text.as_str()) {
                            Ok(event) => {
                                debug!("{} from {}", event.kind(), peer_id);
                                router::route(registry, &peer_id, event);
                            }
                            Err(e) => debug!("Dropping message from {}: {}", peer_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the transport
                    Some(Ok(_)) => {
                        registry.touch(&peer_id);
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error from {}: {:?}", peer_id, e);
                        break;
                    }
                }
            }
        }
    }

    // No-op if the sweeper already removed this peer
    shared.gateway.close_peer(&peer_id);
    if let Err(e) = ws_sender.close().await {
        debug!("Close handshake with {} failed: {:?}", peer_id, e);
    }
    debug!("Connection closed: {}", peer_id);
}
