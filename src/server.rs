use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::peer::connection::RtcTransport;
use crate::peer::types::ServerConfig;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::signaling::{OutboundMessage, SessionContext, SessionDriver};
use crate::streaming::StreamOptions;
use crate::synthesis::{CommandEngine, SynthesisGateway};
use crate::utils::random_id;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SessionContext>,
    pub ice_servers: Arc<Vec<ServerConfig>>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        let engine = CommandEngine::from_config(&config.synthesis);
        let ctx = SessionContext {
            registry: SessionRegistry::new_shared(),
            synthesis: SynthesisGateway::new(Arc::new(engine), config.synthesis_timeout()),
            stream: StreamOptions::from(&config.stream),
            queue_depth: config.stream.queue_depth,
            grace_period: config.grace_period(),
            close_timeout: config.close_timeout(),
        };
        Self {
            ctx: Arc::new(ctx),
            ice_servers: Arc::new(config.ice.servers.clone()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/tts", post(tts_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves until Ctrl-C / SIGTERM, then closes every live session.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(&config);
    let registry = state.ctx.registry.clone();

    let listener = TcpListener::bind(config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let report = registry.close_all().await;
            info!(
                closed = report.closed,
                failed = report.failures.len(),
                "sessions closed"
            );
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.ctx.registry.len(),
    }))
}

async fn ws_upgrade_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// One WebSocket is one control channel is one session.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let id = random_id();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (mut sink, stream) = socket.split();

    let transport = match RtcTransport::new(&id, &state.ice_servers, events_tx).await {
        Ok(t) => t,
        Err(e) => {
            error!(session_id = %id, error = %e, "failed to create peer connection");
            let msg = OutboundMessage::error(format!("failed to create peer connection: {e}"));
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = sink.send(Message::Text(json.into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let writer = tokio::spawn({
        let id = id.clone();
        async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "unserializable control event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    debug!(session_id = %id, error = %e, "control channel write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }
    });

    // Ends at the first close frame or transport error.
    let inbound = Box::pin(
        stream
            .take_while(|msg| {
                futures::future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_))))
            })
            .filter_map(|msg| {
                futures::future::ready(match msg {
                    Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                    _ => None,
                })
            }),
    );

    let session = Session::new(id.clone(), Arc::new(transport));
    let driver = SessionDriver::new(session, out_tx, state.ctx.clone());
    driver.run(inbound, events_rx).await;

    if let Err(e) = writer.await {
        warn!(session_id = %id, error = %e, "control channel writer panicked");
    }
}

#[derive(Debug, Deserialize)]
struct TtsQuery {
    text: String,
}

/// Stateless synthesis: the whole file in one response.
async fn tts_handler(State(state): State<AppState>, Query(query): Query<TtsQuery>) -> Response {
    match state.ctx.synthesis.synthesize(&query.text).await {
        Ok(audio) => (
            [
                (header::CONTENT_TYPE, "audio/wav"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"speech.wav\"",
                ),
            ],
            audio,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "http synthesis failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(engine: ScriptedEngine) -> AppState {
        let ctx = SessionContext {
            registry: SessionRegistry::new_shared(),
            synthesis: SynthesisGateway::new(Arc::new(engine), Some(Duration::from_secs(5))),
            stream: StreamOptions::default(),
            queue_depth: 1,
            grace_period: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
        };
        AppState {
            ctx: Arc::new(ctx),
            ice_servers: Arc::new(Config::default().ice.servers),
        }
    }

    #[tokio::test]
    async fn tts_returns_wav_attachment() {
        let app = router(state(ScriptedEngine::bytes(64)));
        let resp = app
            .oneshot(Request::post("/tts?text=hello").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/wav");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 64);
    }

    #[tokio::test]
    async fn tts_failure_is_500_with_detail() {
        let app = router(state(ScriptedEngine::failing("no model")));
        let resp = app
            .oneshot(Request::post("/tts?text=hello").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["detail"], "no model");
    }

    #[tokio::test]
    async fn health_reports_live_sessions() {
        let app = router(state(ScriptedEngine::bytes(1)));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["sessions"], 0);
    }
}
