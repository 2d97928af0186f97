use crate::{Client, Error, Result, VM_NIC_RESOURCE_TYPE};
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tokio::{sync::mpsc, time};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header, HeaderValue},
    Message,
};
use tracing::{debug, info, trace, warn};
use trafficredirect_controller_core::{ChangeAction, NicChange};

const SUBPROTOCOL: &str = "graphql-transport-ws";
const SUBSCRIPTION_ID: &str = "1";
const RECONNECT_DELAY: time::Duration = time::Duration::from_secs(1);

/// Streams NIC change notifications from Tower.
///
/// The feed is best-effort: notifications published while the websocket is
/// disconnected are lost and must be recovered by a full resync.
pub struct ChangeFeed {
    client: Client,
    url: String,
    api_auth: Option<BasicAuth>,
}

#[derive(Clone)]
struct BasicAuth {
    username: String,
    password: String,
}

/// Messages sent by the server in the `graphql-transport-ws` protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck,
    Ping,
    Pong,
    Next {
        #[serde(default)]
        payload: Value,
    },
    Error {
        #[serde(default)]
        payload: Value,
    },
    Complete,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceChange {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    resource_type: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
}

// === impl ChangeFeed ===

impl ChangeFeed {
    pub fn new(client: Client) -> Self {
        Self {
            url: format!("wss://{}/api/ws", client.addr()),
            client,
            api_auth: None,
        }
    }

    /// Authenticates the websocket upgrade with HTTP basic auth.
    pub fn with_api_auth(mut self, username: impl ToString, password: impl ToString) -> Self {
        self.api_auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Publishes changes to `tx` until its receiver is dropped.
    ///
    /// Connection failures are logged and the feed reconnects after a short
    /// delay.
    pub async fn run(self, tx: mpsc::Sender<NicChange>) {
        loop {
            match self.session(&tx).await {
                Ok(()) => {
                    debug!("Change feed receiver dropped");
                    return;
                }
                Err(error) => warn!(%error, "Change feed disconnected"),
            }
            tokio::select! {
                _ = tx.closed() => return,
                _ = time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Runs a single websocket session, returning `Ok` only once the
    /// receiver has been dropped.
    async fn session(&self, tx: &mpsc::Sender<NicChange>) -> Result<()> {
        let token = self.client.login().await?;

        let mut req = self.url.as_str().into_client_request()?;
        let headers = req.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(SUBPROTOCOL),
        );
        if let Some(auth) = &self.api_auth {
            headers.insert(header::AUTHORIZATION, auth.header_value()?);
        }

        let (mut ws, _) = tokio_tungstenite::connect_async(req).await?;
        ws.send(text(json!({
            "type": "connection_init",
            "payload": { "Authorization": token },
        })))
        .await?;
        debug!(url = %self.url, "Change feed connected");

        loop {
            let msg = tokio::select! {
                _ = tx.closed() => return Ok(()),
                msg = ws.next() => match msg {
                    Some(msg) => msg?,
                    None => return Err(Error::FeedClosed("stream ended".to_string())),
                },
            };

            let msg = match msg {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    ws.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Err(Error::FeedClosed(reason));
                }
                _ => continue,
            };

            let msg = match serde_json::from_str::<ServerMessage>(&msg) {
                Ok(msg) => msg,
                Err(error) => {
                    debug!(%error, %msg, "Ignoring unexpected message");
                    continue;
                }
            };
            match msg {
                ServerMessage::ConnectionAck => {
                    ws.send(text(json!({
                        "id": SUBSCRIPTION_ID,
                        "type": "subscribe",
                        "payload": { "query": subscription() },
                    })))
                    .await?;
                    info!(url = %self.url, "Subscribed to NIC changes");
                }
                ServerMessage::Ping => ws.send(text(json!({ "type": "pong" }))).await?,
                ServerMessage::Pong => {}
                ServerMessage::Next { payload } => {
                    if let Some(change) = parse_change(payload) {
                        if tx.send(change).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                ServerMessage::Error { payload } => {
                    return Err(Error::FeedClosed(format!("subscription failed: {payload}")));
                }
                ServerMessage::Complete => {
                    return Err(Error::FeedClosed("subscription completed".to_string()));
                }
            }
        }
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

// === impl BasicAuth ===

impl BasicAuth {
    fn header_value(&self) -> Result<HeaderValue> {
        let creds = STANDARD.encode(format!("{}:{}", self.username, self.password));
        HeaderValue::from_str(&format!("Basic {creds}")).map_err(|e| {
            Error::WebSocket(tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))
        })
    }
}

fn subscription() -> String {
    format!(
        "subscription {{resourceChange(where: {{resource_type_in: [\"{VM_NIC_RESOURCE_TYPE}\"]}}) {{action,resource_type,resource_id,revision}}}}"
    )
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string())
}

/// Extracts a NIC change from a `next` payload, skipping malformed or
/// irrelevant events.
fn parse_change(payload: Value) -> Option<NicChange> {
    let data = payload.get("data")?.get("resourceChange")?.clone();
    let change = match serde_json::from_value::<ResourceChange>(data) {
        Ok(change) => change,
        Err(error) => {
            warn!(%error, "Skipping undecodable change event");
            return None;
        }
    };

    let (action, resource_type, id) =
        match (change.action, change.resource_type, change.resource_id) {
            (Some(action), Some(resource_type), Some(id)) => (action, resource_type, id),
            (action, resource_type, id) => {
                warn!(?action, ?resource_type, ?id, "Skipping incomplete change event");
                return None;
            }
        };
    trace!(%action, %resource_type, %id, "Received change event");

    if resource_type != VM_NIC_RESOURCE_TYPE {
        warn!(%resource_type, %id, "Skipping change event for unexpected resource type");
        return None;
    }

    let action = match parse_action(&action) {
        Some(action) => action,
        None => {
            warn!(%action, %id, "Skipping change event with unknown action");
            return None;
        }
    };
    Some(NicChange { action, id })
}

fn parse_action(action: &str) -> Option<ChangeAction> {
    [
        ("insert", ChangeAction::Insert),
        ("update", ChangeAction::Update),
        ("delete", ChangeAction::Delete),
    ]
    .into_iter()
    .find_map(|(name, a)| action.eq_ignore_ascii_case(name).then_some(a))
}
