use super::{HookEvent, HookRequest, HookSink};
use crate::config::CoreConfig;
use crate::errors::CoreError;
use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, body::Incoming};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

/// Local HTTP listener for session hook callbacks.
///
/// Must be listening before the registry accepts spawn calls: spawned
/// processes receive the effective endpoint in their environment, so the
/// address has to exist first. Binds the preferred port, falling back to an
/// ephemeral one when it is taken.
pub struct HookServer {
    config: Arc<CoreConfig>,
    sink: Arc<dyn HookSink>,
    bound: RwLock<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
    in_flight: Arc<AtomicUsize>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl HookServer {
    pub fn new(config: Arc<CoreConfig>, sink: Arc<dyn HookSink>) -> Self {
        Self {
            config,
            sink,
            bound: RwLock::new(None),
            running: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind and start accepting. Idempotent; a second call returns the
    /// already-effective address.
    pub async fn start(&self) -> Result<SocketAddr, CoreError> {
        let mut running = self.running.lock().await;
        if running.is_some()
            && let Some(addr) = self.endpoint()
        {
            return Ok(addr);
        }

        let preferred = SocketAddr::from(([127, 0, 0, 1], self.config.hook_port));
        let listener = match TcpListener::bind(preferred).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(
                    "Preferred hook port {} unavailable ({e}), falling back to ephemeral",
                    self.config.hook_port
                );
                TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                    .await
                    .map_err(|e| CoreError::io("bind", "127.0.0.1", e))?
            }
        };

        let addr = listener
            .local_addr()
            .map_err(|e| CoreError::io("local_addr", "127.0.0.1", e))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = self.sink.clone();
        let in_flight = self.in_flight.clone();
        let conn_tasks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            sink,
            shutdown_rx,
            in_flight,
            conn_tasks.clone(),
        ));

        *self.bound.write().unwrap() = Some(addr);
        *running = Some(Running {
            shutdown_tx,
            accept_task,
            conn_tasks,
        });

        info!("Hook server listening on {addr}");
        Ok(addr)
    }

    pub fn is_listening(&self) -> bool {
        self.bound.read().unwrap().is_some()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.bound.read().unwrap()
    }

    /// URL spawned sessions use to post callbacks.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint().map(|addr| format!("http://{addr}/hooks"))
    }

    /// Stop accepting, let in-flight requests finish within the drain
    /// timeout, then force-close. Never fails.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };
        *self.bound.write().unwrap() = None;

        let _ = state.shutdown_tx.send(true);

        let deadline = Instant::now() + self.config.drain_timeout();
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        let leftover = self.in_flight.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!("Hook server drain timed out with {leftover} request(s) in flight; force-closing");
        }
        for task in state.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        state.accept_task.abort();
        info!("Hook server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    sink: Arc<dyn HookSink>,
    mut shutdown_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    conn_tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Hook server accept failed: {e}");
                        continue;
                    }
                };
                debug!("Hook connection from {peer}");

                // One task per connection: a slow client never blocks others.
                let sink = sink.clone();
                let in_flight = in_flight.clone();
                let task = tokio::spawn(async move {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let sink = sink.clone();
                        async move { handle_request(req, sink).await }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("Hook connection error: {e}");
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });

                let mut tasks = conn_tasks.lock().unwrap();
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    sink: Arc<dyn HookSink>,
) -> Result<Response<String>, hyper::Error> {
    if req.method() != Method::POST || req.uri().path() != "/hooks" {
        return Ok(status_response(StatusCode::NOT_FOUND, "Not Found"));
    }

    let body = req.into_body().collect().await?.to_bytes();
    let request: HookRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed hook payload: {e}");
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({ "error": e.to_string() }).to_string(),
            ));
        }
    };

    let event = HookEvent::from_request(request);
    let token = event.correlation_token.clone();

    // Fire-and-forget semantics: senders always get an ack, even when the
    // token resolves to nothing. Session tooling must never crash because
    // its session ended a moment ago.
    match sink.deliver(event).await {
        Ok(()) => {}
        Err(CoreError::CorrelationMiss { token }) => {
            warn!("Dropping hook event with unknown correlation token '{token}'");
        }
        Err(e) => {
            warn!("Hook delivery for token '{token}' failed: {e}");
        }
    }

    Ok(status_response(
        StatusCode::OK,
        &serde_json::json!({ "ok": true }).to_string(),
    ))
}

fn status_response(status: StatusCode, body: &str) -> Response<String> {
    let mut response = Response::new(body.to_string());
    *response.status_mut() = status;
    response
}
