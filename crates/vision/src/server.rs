//! Result broadcasting.
//!
//! Pipelines publish through the [`Broadcaster`] trait and never know about the
//! transport. [`EventServer`] is the process-wide implementation: an Actix Web
//! server on its own thread that fans published payloads out as Server-Sent
//! Events and keeps the last payload per topic for polling clients.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

use crate::pipeline::telemetry;

/// Default port subscribers connect to.
pub const DEFAULT_BROADCAST_PORT: u16 = 54834;

/// Fire-and-forget publication of pipeline results.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);
}

#[derive(Clone, Debug)]
struct Event {
    topic: String,
    payload: String,
}

type LatestMap = Arc<Mutex<BTreeMap<String, String>>>;

struct ServerState {
    events: broadcast::Sender<Event>,
    latest: LatestMap,
}

/// Handle to the broadcast server thread. Stops the server when dropped.
pub struct EventServer {
    events: broadcast::Sender<Event>,
    latest: LatestMap,
    local_addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventServer {
    /// Bind `addr` and start serving on a dedicated thread.
    pub fn spawn(addr: SocketAddr) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let latest: LatestMap = Arc::default();

        // Bind on the calling thread so address errors surface synchronously.
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind broadcast server on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let server_events = events.clone();
        let server_latest = latest.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = telemetry::spawn_thread("vision-broadcast-server", move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            events: server_events.clone(),
                            latest: server_latest.clone(),
                        }))
                        .route("/events", web::get().to(events_handler))
                        .route("/latest", web::get().to(latest_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .workers(1)
                .listen(listener)?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("Broadcast server error: {err}");
            }
        })
        .context("Failed to spawn broadcast server thread")?;

        info!("broadcast server listening on http://{local_addr}");
        Ok(Self {
            events,
            latest,
            local_addr,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Last payload published on `topic`.
    pub fn latest(&self, topic: &str) -> Option<String> {
        self.latest
            .lock()
            .ok()
            .and_then(|map| map.get(topic).cloned())
    }

    /// Signal the server to stop and wait for its thread.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = handle.join();
        }
    }
}

impl Broadcaster for EventServer {
    fn publish(&self, topic: &str, payload: &str) {
        if let Ok(mut map) = self.latest.lock() {
            map.insert(topic.to_string(), payload.to_string());
        }
        // No subscribers is not an error for a fire-and-forget channel.
        if self
            .events
            .send(Event {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
            .is_err()
        {
            debug!(topic, "published with no live subscribers");
        }
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    fn publish(&self, topic: &str, payload: &str) {
        (**self).publish(topic, payload)
    }
}

fn sse_chunk(event: &Event) -> Bytes {
    let mut chunk = String::with_capacity(event.topic.len() + event.payload.len() + 16);
    chunk.push_str("event: ");
    chunk.push_str(&event.topic);
    chunk.push('\n');
    for line in event.payload.lines() {
        chunk.push_str("data: ");
        chunk.push_str(line);
        chunk.push('\n');
    }
    if event.payload.is_empty() {
        chunk.push_str("data: \n");
    }
    chunk.push('\n');
    Bytes::from(chunk)
}

/// Stream published events as Server-Sent Events.
async fn events_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut rx = state.events.subscribe();
    let snapshot: Vec<Event> = state
        .latest
        .lock()
        .map(|map| {
            map.iter()
                .map(|(topic, payload)| Event {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        for event in &snapshot {
            yield Ok::<Bytes, actix_web::Error>(sse_chunk(event));
        }
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok::<Bytes, actix_web::Error>(sse_chunk(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let note = format!(": skipped {skipped} events\n\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(note));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Return the last payload per topic as JSON.
async fn latest_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.latest.lock() {
        Ok(map) => HttpResponse::Ok()
            .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
            .json(&*map),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Prometheus text exposition of the process metrics.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
