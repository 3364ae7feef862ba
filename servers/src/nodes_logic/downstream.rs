use crate::nodes_logic::config::Settings;
use crate::nodes_logic::rest;
use crate::nodes_logic::state::AppState;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

/// The full application: the `/ws` endpoint plus the REST routes.
pub fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .merge(rest::routes())
        .layer(cors)
        .with_state(app_state)
}

/// Serves until a value arrives on `shutdown`. TLS is used when both
/// certificate paths are configured.
pub async fn run(settings: Settings, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some((cert_path, key_path)) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))?;
        log::info!("Downstream server listening on wss://{}", addr);

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        log::info!("Downstream server listening on ws://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Pumps one connection: client frames go to the session, queued server
/// messages go to the socket. Either side closing ends the session.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut session, mut outbound) = state.hub.open_session();
    let client_id = session.id();
    log::info!("Client {} connected", client_id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(_))) => session.reject("binary frames are not supported"),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("Client {} read error: {}", client_id, err);
                        break;
                    }
                }
            }
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                match message.to_json() {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(err) => log::error!("Client {}: failed to encode {:?}: {}", client_id, message, err),
                }
            }
        }
    }

    session.close();
    let _ = sender.close().await;
    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::fetcher::ScriptedFetcher;
    use lib_common::core::{HostConfig, MetricsFetcher, NodeHub, SchedulerConfig};
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message as TMessage;

    async fn spawn_app() -> (SocketAddr, AppState) {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let hub = NodeHub::new(SchedulerConfig::default(), fetcher as Arc<dyn MetricsFetcher>).unwrap();
        hub.scheduler()
            .register_host(HostConfig {
                host_id: "pve-01".into(),
                display_name: "Rack One".into(),
                base_url: "https://10.0.0.1:8006".into(),
                auth_token_id: "t".into(),
                auth_token_secret: "s".into(),
            })
            .unwrap();
        let state = AppState::new(hub);
        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    #[tokio::test]
    async fn test_cors_headers_on_rest_routes() {
        let (addr, _state) = spawn_app().await;
        let response = reqwest::Client::new()
            .get(format!("http://{}/api/nodes", addr))
            .header("Origin", "http://dashboard.lan")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    /// Next text frame as JSON, skipping control frames.
    async fn next_frame(ws: &mut Client) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame within 5s")
                .expect("stream ended")
                .unwrap();
            if let TMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let (addr, state) = spawn_app().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        let hosts = next_frame(&mut ws).await;
        assert_eq!(hosts["type"], "hosts");
        assert_eq!(hosts["hosts"][0]["id"], "pve-01");

        ws.send(TMessage::Text(r#"{"type":"subscribe","hostId":"pve-01"}"#.into()))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        for _ in 0..4 {
            let frame = next_frame(&mut ws).await;
            assert_eq!(frame["hostId"], "pve-01");
            kinds.push(frame["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["subscribed", "connecting", "connected", "data"]);
        assert_eq!(state.hub.subscriber_count("pve-01"), 1);

        ws.send(TMessage::Binary(vec![1u8, 2, 3].into())).await.unwrap();
        let error = loop {
            let frame = next_frame(&mut ws).await;
            if frame["type"] != "data" {
                break frame;
            }
        };
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "INVALID_MESSAGE");

        ws.close(None).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while state.hub.dispatcher().client_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.hub.dispatcher().client_count(), 0);
        assert_eq!(state.hub.subscriber_count("pve-01"), 0);
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_route_is_not_upgraded() {
        let (addr, state) = spawn_app().await;
        let response = reqwest::get(format!("http://{}/ws", addr)).await.unwrap();
        assert!(response.status().is_client_error());
        assert_eq!(state.hub.dispatcher().client_count(), 0);
    }
}
