//! Local caching proxy hosting the worker.
//!
//! Every path except `/api/*` is run through the fetch interceptor against
//! the configured origin. Pages talk to the worker over `/api/ws`: each
//! socket is one client, text frames carry [`Message`] JSON both ways.

use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::Result;
use crate::fetch::{Destination, FetchRequest, FetchResponse};
use crate::lifecycle::WorkerHandle;
use crate::message::Message;

const SEC_FETCH_DEST: &str = "sec-fetch-dest";

#[derive(Clone)]
struct AppState {
    handle: WorkerHandle,
    origin: Url,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    generation: String,
    state: String,
    clients: usize,
}

async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    let worker = state.handle.worker();
    axum::Json(HealthResponse {
        status: "ok".to_string(),
        generation: worker.generation_id().to_string(),
        state: worker.state().to_string(),
        clients: worker.clients().len(),
    })
}

async fn api_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// Bridges one WebSocket to a registered client.
async fn client_session(socket: WebSocket, state: AppState) {
    let clients = state.handle.worker().clients().clone();
    let (client, mut notifications) = clients.connect();
    log::info!("Client {client} connected");

    let (mut sink, mut frames) = socket.split();
    let forward = tokio::spawn(async move {
        while let Some(message) = notifications.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Failed to encode notification: {e}");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match Message::decode(text.as_str()) {
                Ok(message) => {
                    if let Err(e) = state.handle.post_message(client, message).await {
                        log::error!("Worker unavailable: {e}");
                        break;
                    }
                }
                Err(e) => log::warn!("Client {client} sent an invalid message: {e}"),
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Client {client} socket error: {e}");
                break;
            }
        }
    }

    clients.disconnect(client);
    forward.abort();
    log::info!("Client {client} disconnected");
}

/// Maps a proxied request onto a fetch event. The target's path and query
/// are placed on the origin, so every proxied URL stays on its host.
fn fetch_request(origin: &Url, method: Method, uri: &Uri, headers: &HeaderMap) -> FetchRequest {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url.set_fragment(None);

    let destination = headers
        .get(SEC_FETCH_DEST)
        .and_then(|v| v.to_str().ok())
        .map_or(Destination::Other, Destination::from_fetch_dest);

    let mut request = FetchRequest::get(url)
        .with_method(method)
        .with_destination(destination);
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        request = request.with_range(range);
    }
    request
}

fn into_response(response: FetchResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

async fn intercept(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = fetch_request(&state.origin, method, &uri, &headers);
    let url = request.url.clone();

    match state.handle.fetch(request).await {
        Ok(response) => into_response(response),
        Err(e) => {
            log::warn!("No response for {url}: {e}");
            (StatusCode::BAD_GATEWAY, format!("Upstream unavailable: {e}")).into_response()
        }
    }
}

/// Builds the proxy router.
///
/// # Errors
///
/// Returns an error if the worker's origin is invalid.
pub fn router(handle: WorkerHandle) -> Result<Router> {
    let origin = handle.worker().config().origin_url()?;
    let state = AppState { handle, origin };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/api/health", get(api_health))
        .route("/api/ws", get(api_ws))
        .fallback(intercept)
        .layer(cors)
        .with_state(state))
}

/// Serves the proxy on `listen` until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(listen: SocketAddr, handle: WorkerHandle) -> Result<()> {
    let app = router(handle.clone())?;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!(
        "Proxying {} on http://{}",
        handle.worker().config().origin,
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutting down");
        })
        .await?;

    handle.worker().shutdown();
    Ok(())
}
