//! HTTP and WebSocket handlers for the feed gateway

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, OriginalUri, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::{deny, deny_json, AuthRequest};
use crate::broadcaster::Broadcaster;
use crate::connection::FeedConnection;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::Error;
use crate::registry::ConnectionRegistry;
use crate::token::TokenService;

/// Shared state for handlers
#[derive(Clone)]
pub struct GatewayState {
    pub registry: ConnectionRegistry,
    pub broadcaster: Broadcaster,
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: TokenService,
    /// Reject feed upgrades without a valid token
    pub require_auth: bool,
    /// Send the last broadcast payload to new feed connections
    pub replay_latest: bool,
    /// End authenticated sessions when their token expires
    pub close_on_expiry: bool,
    pub send_queue: usize,
}

/// How long a closed connection may spend flushing its close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// Health endpoint
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "ok" }))
}

fn parse_credentials(body: Result<Json<Credentials>, JsonRejection>) -> Result<Credentials, Error> {
    let Json(credentials) = body.map_err(|_| Error::Validation("invalid request".to_string()))?;
    credentials.validate()?;
    Ok(credentials)
}

/// `POST /login`
pub async fn login(
    State(state): State<GatewayState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<TokenResponse>, Error> {
    let credentials = parse_credentials(body)?;

    let user = match state
        .credentials
        .verify(credentials.email(), &credentials.password)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(email = %credentials.email(), error = %e, "Login failed");
            return Err(e);
        }
    };
    let token = state.tokens.issue(&user)?;

    tracing::info!(email = %user.email, "User logged in");
    Ok(Json(TokenResponse { token }))
}

/// `POST /signup`
///
/// Failures are reported in the body with a `200` status.
pub async fn signup(
    State(state): State<GatewayState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Response {
    let result: Result<String, Error> = async {
        let credentials = parse_credentials(body)?;
        let user = state
            .credentials
            .create(credentials.email(), &credentials.password)
            .await?;
        state.tokens.issue(&user)
    }
    .await;

    match result {
        Ok(token) => (StatusCode::OK, Json(TokenResponse { token })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Sign up failed");
            let message = match &e {
                Error::Validation(msg) => msg.clone(),
                _ => "error creating user".to_string(),
            };
            (StatusCode::OK, Json(serde_json::json!({ "error": message }))).into_response()
        }
    }
}

/// `POST /validate`
pub async fn validate(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.tokens.validate_bearer(authorization) {
        Ok(claims) => {
            tracing::debug!(email = %claims.sub, "Token validated");
            (StatusCode::OK, Json("valid token")).into_response()
        }
        Err(e) => {
            tracing::debug!(error = %e, "Token rejected");
            deny(&e)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse {
    pub id: String,
    pub data: String,
    pub updated_at: String,
}

/// `GET /data`: the last broadcast payload, for authenticated callers
pub async fn data(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.tokens.validate_bearer(authorization) {
        return deny(&e);
    }

    match state.broadcaster.latest().await {
        Some(payload) => Json(DataResponse {
            id: payload.id,
            data: String::from_utf8_lossy(&payload.data).into_owned(),
            updated_at: payload.updated_at.to_rfc3339(),
        })
        .into_response(),
        None => deny_json(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": "no data available yet" }),
        ),
    }
}

// Stats endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_connections: usize,
    pub feed_id: String,
    pub connections: Vec<ConnectionStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub id: String,
    pub remote_addr: Option<String>,
    pub subject: Option<String>,
    pub connected_at: String,
    pub is_active: bool,
}

pub async fn get_stats(State(state): State<GatewayState>) -> Json<StatsResponse> {
    let connections: Vec<ConnectionStats> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|c| ConnectionStats {
            is_active: c.is_active(),
            id: c.id,
            remote_addr: c.metadata.remote_addr.map(|a| a.to_string()),
            subject: c.metadata.subject,
            connected_at: c.metadata.connected_at.to_rfc3339(),
        })
        .collect();

    Json(StatsResponse {
        total_connections: connections.len(),
        feed_id: state.broadcaster.feed_id().to_string(),
        connections,
    })
}

/// Realtime feed endpoint
pub async fn feed_connect(
    State(state): State<GatewayState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let auth_request = AuthRequest::new(method, uri, headers, Some(remote_addr));

    let claims = match auth_request.authenticate(&state.tokens) {
        Ok(claims) => Some(claims),
        Err(e) if state.require_auth => {
            tracing::warn!(
                client_ip = ?auth_request.client_ip,
                error = %e,
                "Feed connection denied"
            );
            return deny(&e);
        }
        Err(_) => None,
    };

    let expires_in = claims
        .as_ref()
        .filter(|_| state.close_on_expiry)
        .and_then(|c| c.expires_at())
        .map(|at| (at - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO));

    let (connection, receiver) = FeedConnection::with_capacity(
        state.send_queue,
        Some(remote_addr),
        claims.map(|c| c.sub),
        user_agent,
    );

    tracing::info!(
        connection_id = %connection.id,
        client_ip = ?auth_request.client_ip,
        subject = ?connection.metadata.subject,
        "New feed connection"
    );

    ws.on_upgrade(move |socket| serve_connection(socket, connection, receiver, expires_in, state))
}

async fn serve_connection(
    socket: WebSocket,
    connection: FeedConnection,
    mut receiver: mpsc::Receiver<Bytes>,
    expires_in: Option<Duration>,
    state: GatewayState,
) {
    let connection_id = connection.id.clone();
    state
        .broadcaster
        .admit(connection.clone(), state.replay_latest)
        .await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: drain queued payloads onto the socket
    let writer_connection = connection.clone();
    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        let expiry = async move {
            match expires_in {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                _ = writer_connection.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = &mut expiry => {
                    tracing::info!(
                        connection_id = %writer_id,
                        "Token expired, closing feed connection"
                    );
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = receiver.recv() => {
                    let Some(data) = msg else { break };
                    // A client that stops reading must not pin the socket after close
                    tokio::select! {
                        result = ws_tx.send(Message::Binary(data)) => {
                            if let Err(e) = result {
                                tracing::debug!(
                                    connection_id = %writer_id,
                                    error = %e,
                                    "Socket write failed"
                                );
                                break;
                            }
                        }
                        _ = writer_connection.closed() => break,
                    }
                }
            }
        }
    });

    // Reader task: the feed is one-way, reads only detect close
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        _ = connection.closed() => {
            // Let the writer send its close frame, then drop both halves
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
            reader.abort();
        }
    }

    state.registry.deregister(&connection_id);
    tracing::info!(connection_id = %connection_id, "Feed connection closed");
}
