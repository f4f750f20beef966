use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::AppState;
use crate::hub::{ClientHub, Outbound};
use crate::orchestrator::Orchestrator;
use crate::protocol::ClientId;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Key to reuse, e.g. after a page reload
    pub client_id: Option<String>,
}

/// Upgrade to WebSocket and register the connection with the hub
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let orchestrator = Arc::clone(&state.orchestrator);
    let requested = params.client_id.filter(|id| !id.trim().is_empty());

    ws.on_upgrade(move |socket| handle_socket(socket, requested, orchestrator))
}

/// Claim the requested key, or a fresh one when a live connection holds it
async fn claim_client_id(
    hub: &ClientHub,
    requested: Option<ClientId>,
) -> (ClientId, u64, mpsc::Receiver<Outbound>) {
    let mut candidate = requested;
    loop {
        let client_id = candidate.take().unwrap_or_else(|| Uuid::new_v4().to_string());
        match hub.register_if_absent(client_id.clone()).await {
            Some((connection_id, rx)) => return (client_id, connection_id, rx),
            None => debug!("Client key {} is already connected, assigning a new one", client_id),
        }
    }
}

/// Frame telling a client which key its jobs must be submitted under
fn connected_frame(client_id: &str) -> String {
    json!({ "message": "connected", "clientId": client_id }).to_string()
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Default::default()),
        Outbound::Close => Message::Close(None),
    }
}

async fn handle_socket(
    socket: WebSocket,
    requested: Option<ClientId>,
    orchestrator: Arc<Orchestrator>,
) {
    let hub = Arc::clone(orchestrator.hub());
    let (client_id, connection_id, mut rx) = claim_client_id(&hub, requested).await;
    info!("WebSocket connected: {}", client_id);
    let (mut sink, mut stream) = socket.split();

    if sink
        .send(Message::Text(connected_frame(&client_id).into()))
        .await
        .is_err()
    {
        debug!("Client {} went away before the handshake frame", client_id);
    }

    let sender_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = frame == Outbound::Close;
            if sink.send(to_message(frame)).await.is_err() {
                debug!("WebSocket sink closed for {}", sender_id);
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => trace!("Pong from {}", client_id),
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket receive error for {}: {}", client_id, e);
                break;
            }
        }
    }

    disconnect(&hub, &orchestrator, &client_id, connection_id).await;
    send_task.abort();
}

/// Forget a client: no new jobs start for it and running ones are killed
///
/// Nothing happens when a newer connection already took over the key.
async fn disconnect(
    hub: &ClientHub,
    orchestrator: &Orchestrator,
    client_id: &str,
    connection_id: u64,
) {
    if !hub.unregister_connection(client_id, connection_id).await {
        debug!("WebSocket {} closed after its key was reclaimed", client_id);
        return;
    }
    orchestrator.registry().withdraw(client_id).await;
    let killed = orchestrator.registry().terminate_all(client_id).await;
    info!("WebSocket disconnected: {} ({} processes terminated)", client_id, killed);
}

/// Ping every connection at a fixed interval until aborted
pub fn start_heartbeat(hub: Arc<ClientHub>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        loop {
            interval.tick().await;
            let count = hub.connection_count().await;
            debug!("WebSocket heartbeat ping to {} connections", count);
            hub.ping_all().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_frame() {
        let frame: serde_json::Value = serde_json::from_str(&connected_frame("abc")).unwrap();
        assert_eq!(frame["message"], "connected");
        assert_eq!(frame["clientId"], "abc");
    }

    #[test]
    fn test_outbound_mapping() {
        assert!(matches!(to_message(Outbound::Close), Message::Close(None)));
        assert!(matches!(to_message(Outbound::Ping), Message::Ping(_)));
        assert!(matches!(to_message(Outbound::Text("x".into())), Message::Text(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_pings_connections() {
        let hub = Arc::new(ClientHub::new());
        let mut rx = hub.register("a").await;

        let heartbeat = start_heartbeat(Arc::clone(&hub), Duration::from_millis(10));
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        heartbeat.abort();

        assert_eq!(frame, Some(Outbound::Ping));
    }

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        Orchestrator::from_config(&crate::config::HubConfig {
            engine: crate::worker::EngineConfig {
                transcriptions_dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_withdraws_and_kills() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let hub = Arc::clone(orchestrator.hub());
        let (client_id, connection_id, _rx) = claim_client_id(&hub, Some("a".into())).await;
        assert_eq!(client_id, "a");
        orchestrator.registry().admit("a").await;

        let (handle, mut kill_rx) =
            crate::registry::ProcessHandle::new("a".into(), Uuid::new_v4(), 1, None);
        orchestrator.registry().register(handle).await.unwrap();

        disconnect(&hub, &orchestrator, "a", connection_id).await;

        assert!(!orchestrator.registry().is_admitted("a").await);
        assert!(kill_rx.try_recv().is_ok());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_handshake_with_live_key_gets_fresh_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let hub = Arc::clone(orchestrator.hub());

        let (first, first_conn, _first_rx) = claim_client_id(&hub, Some("a".into())).await;
        let (second, second_conn, _second_rx) = claim_client_id(&hub, Some("a".into())).await;
        assert_eq!(first, "a");
        assert_ne!(second, "a");

        orchestrator.registry().admit("a").await;
        disconnect(&hub, &orchestrator, &second, second_conn).await;
        assert!(hub.is_open("a").await);
        assert!(orchestrator.registry().is_admitted("a").await);

        disconnect(&hub, &orchestrator, &first, first_conn).await;
        assert!(!hub.is_open("a").await);
    }

    #[tokio::test]
    async fn test_stale_socket_leaves_new_owner_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir);
        let hub = Arc::clone(orchestrator.hub());

        let (_, stale_conn, _stale_rx) = claim_client_id(&hub, Some("a".into())).await;
        hub.terminate("a").await;
        let (client_id, _, _rx) = claim_client_id(&hub, Some("a".into())).await;
        assert_eq!(client_id, "a");
        orchestrator.registry().admit("a").await;

        disconnect(&hub, &orchestrator, "a", stale_conn).await;

        assert!(hub.is_open("a").await);
        assert!(orchestrator.registry().is_admitted("a").await);
    }
}
