/// Inbox REST API + SSE: local HTTP gateway in front of one conversation controller
///
/// Endpoints:
///   GET    /api/threads                 ?q=<text>&status=all|unread|read
///   GET    /api/threads/:id
///   GET    /api/unread                  badge total plus store-side total
///   GET    /api/status
///   GET    /api/messages                open thread, merged with local sends
///   POST   /api/threads/:id/select
///   POST   /api/deselect
///   POST   /api/threads/:id/messages    body: {"body":"..."}
///   POST   /api/threads/:id/archive
///   POST   /api/outbox/:temp_id/retry
///   DELETE /api/outbox/:temp_id
///   POST   /api/read-all
///   POST   /api/bookings                body: Booking JSON
///   GET    /events                      SSE stream of {"total": N}
use crate::booking_store::{Booking, BookingStore};
use crate::controller::ConversationController;
use crate::error::{ErrorKind, InboxError, Result};
use crate::messenger_types::{ReadFilter, ThreadFilter};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

/// Everything a request handler can touch
pub struct ApiState {
    pub controller: ConversationController,
    pub bookings: BookingStore,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

/// HTTP status for a failed operation
pub fn status_for(err: &InboxError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::Superseded => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn inbox_err(err: &InboxError) -> Resp {
    json_resp(
        status_for(err),
        serde_json::to_vec(&serde_json::json!({
            "error": err.to_string(),
            "kind": err.kind(),
        }))
        .unwrap_or_default(),
    )
}

fn sse_resp(controller: &ConversationController) -> Resp {
    let feed = controller.badge();

    // Current total goes out immediately so the header never starts blank
    let initial = format!(
        ": connected\n\ndata: {}\n\n",
        serde_json::json!({ "total": feed.current() })
    );
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(bytes::Bytes::from(initial)))
    });

    let updates = unfold(feed, |mut feed| async move {
        let total = feed.changed().await?;
        let data = format!("data: {}\n\n", serde_json::json!({ "total": total }));
        Some((Ok::<_, Infallible>(Frame::data(bytes::Bytes::from(data))), feed))
    });

    let stream = first.chain(updates);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Inbox API listening on http://{}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections forever
pub async fn serve(listener: TcpListener, state: Arc<ApiState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("Inbox API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Inbox API accept error: {}", e),
        }
    }
}

pub async fn start_inbox_api(state: Arc<ApiState>, addr: SocketAddr) -> Result<()> {
    let listener = bind(addr).await?;
    serve(listener, state).await
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Splits `/api/<prefix>/<id>/<action>` into (id, action)
fn split_resource<'a>(path: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let rest = path.strip_prefix(prefix)?;
    let (raw_id, action) = match rest.split_once('/') {
        Some((id, action)) => (id, action),
        None => (rest, ""),
    };
    if raw_id.is_empty() {
        return None;
    }
    let id = urlencoding::decode(raw_id).ok()?.into_owned();
    Some((id, action))
}

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<ApiState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    debug!("{} {}", method, path);

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    let controller = &state.controller;
    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/threads") => get_threads(&query, controller).await,
        (Method::GET, "/api/unread") => get_unread(controller).await,
        (Method::GET, "/api/status") => get_status(controller).await,
        (Method::GET, "/api/messages") => {
            json_ok(serde_json::json!({ "messages": controller.messages().await }))
        }
        (Method::POST, "/api/deselect") => {
            controller.deselect().await;
            json_ok(serde_json::json!({ "success": true }))
        }
        (Method::POST, "/api/read-all") => {
            let marked = controller.mark_all_read().await;
            json_ok(serde_json::json!({ "marked": marked }))
        }
        (Method::POST, "/api/bookings") => post_booking(req, &state.bookings).await,
        (Method::GET, "/events") => sse_resp(controller),
        _ => {
            if let Some((thread_id, action)) = split_resource(&path, "/api/threads/") {
                return match (method, action) {
                    (Method::GET, "") => match controller.thread(&thread_id).await {
                        Some(thread) => json_ok(serde_json::json!({ "thread": thread })),
                        None => json_err(StatusCode::NOT_FOUND, "thread not found"),
                    },
                    (Method::POST, "select") => post_select(&thread_id, controller).await,
                    (Method::POST, "messages") => post_message(req, &thread_id, controller).await,
                    (Method::POST, "archive") => match controller.archive_thread(&thread_id).await {
                        Ok(()) => json_ok(serde_json::json!({ "archived": thread_id })),
                        Err(e) => inbox_err(&e),
                    },
                    _ => json_err(StatusCode::NOT_FOUND, "not found"),
                };
            }
            if let Some((temp_id, action)) = split_resource(&path, "/api/outbox/") {
                return match (method, action) {
                    (Method::POST, "retry") => match controller.retry_send(&temp_id).await {
                        Ok(message) => json_ok(serde_json::json!({ "message": message })),
                        Err(e) => inbox_err(&e),
                    },
                    (Method::DELETE, "") => match controller.discard_failed(&temp_id).await {
                        Ok(()) => json_ok(serde_json::json!({ "removed": temp_id })),
                        Err(e) => inbox_err(&e),
                    },
                    _ => json_err(StatusCode::NOT_FOUND, "not found"),
                };
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

fn parse_filter(query: &str) -> std::result::Result<ThreadFilter, String> {
    let mut filter = ThreadFilter::default();
    for pair in query.split('&') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(&v.replace('+', " "))
            .map_err(|e| e.to_string())?
            .into_owned();
        match k {
            "q" => filter.query = Some(value),
            "status" => filter.status = value.parse::<ReadFilter>().map_err(|e| e.to_string())?,
            _ => {}
        }
    }
    Ok(filter)
}

async fn get_threads(query: &str, controller: &ConversationController) -> Resp {
    let filter = match parse_filter(query) {
        Ok(f) => f,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &e),
    };
    let threads = controller.threads(&filter).await;
    json_ok(serde_json::json!({ "threads": threads }))
}

async fn get_unread(controller: &ConversationController) -> Resp {
    let total = controller.unread_total().await;
    // Store-side figure is informational; the badge never waits on it
    let server_total = controller.server_unread_total().await.ok();
    json_ok(serde_json::json!({
        "total": total,
        "server_total": server_total,
    }))
}

async fn get_status(controller: &ConversationController) -> Resp {
    let status = controller.status().await;
    json_ok(serde_json::json!({
        "user_id": controller.user_id(),
        "status": status,
    }))
}

async fn post_select(thread_id: &str, controller: &ConversationController) -> Resp {
    match controller.select_thread(thread_id).await {
        Ok(messages) => json_ok(serde_json::json!({
            "thread_id": thread_id,
            "messages": messages,
        })),
        Err(e) => inbox_err(&e),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    body: String,
}

async fn post_message(
    req: Request<hyper::body::Incoming>,
    thread_id: &str,
    controller: &ConversationController,
) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: SendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    match controller.send_message(thread_id, &r.body).await {
        Ok(message) => json_ok(serde_json::json!({ "message": message })),
        Err(e) => inbox_err(&e),
    }
}

async fn post_booking(req: Request<hyper::body::Incoming>, bookings: &BookingStore) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let booking: Booking = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    match bookings.upsert(&booking) {
        Ok(()) => json_ok(serde_json::json!({ "booking": booking })),
        Err(e) => inbox_err(&e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}
