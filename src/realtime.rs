use crate::backend_api::{from_json, SupabaseClient, TableRef};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

// This file implements just enough of the Supabase Realtime protocol
// (Phoenix channels, v1 JSON serializer) to learn that rows in the
// devices table changed:
// <https://supabase.com/docs/guides/realtime/protocol>

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const JOIN_REF: &str = "1";

#[derive(
    Deserialize,
    Serialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Something changed in the watched table.
/// The row data is deliberately not carried; receivers
/// are expected to re-fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
}

#[derive(thiserror::Error, Debug)]
pub enum RealtimeError {
    #[error("realtime join of {topic} was rejected: {reason}")]
    JoinRejected { topic: String, reason: String },
    #[error("realtime channel {topic} errored: {reason}")]
    ChannelError { topic: String, reason: String },
    #[error("realtime connection closed by server")]
    ConnectionClosed,
}

/// A source of change notifications for a table
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, table: &TableRef) -> anyhow::Result<Subscription>;
}

/// A live subscription to change events.
/// The subscription is released either by calling `close`,
/// which politely leaves the channel, or by dropping it.
pub struct Subscription {
    topic: String,
    events: mpsc::Receiver<ChangeEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wraps a bare receiver; used by feeds that have no
    /// connection of their own to manage
    #[cfg(test)]
    pub fn from_receiver<T: Into<String>>(topic: T, events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            topic: topic.into(),
            events,
            shutdown: None,
            task: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the next change, or None once the subscription
    /// has ended
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub async fn close(mut self) {
        log::debug!("closing subscription {}", self.topic);
        self.events.close();
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(task) = self.task.take() {
            task.await.ok();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A message in the Phoenix channels v1 JSON format
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl PhoenixMessage {
    fn new<T: Into<String>, E: Into<String>>(
        topic: T,
        event: E,
        payload: JsonValue,
        msg_ref: String,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref: Some(msg_ref),
        }
    }

    pub fn to_message(&self) -> anyhow::Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

pub fn channel_topic(table: &TableRef) -> String {
    format!("realtime:{}:{}", table.schema, table.table)
}

pub fn join_message(table: &TableRef) -> PhoenixMessage {
    PhoenixMessage::new(
        channel_topic(table),
        "phx_join",
        serde_json::json!({
            "config": {
                "postgres_changes": [{
                    "event": "*",
                    "schema": table.schema,
                    "table": table.table,
                }]
            }
        }),
        JOIN_REF.to_string(),
    )
}

pub fn heartbeat_message(msg_ref: String) -> PhoenixMessage {
    PhoenixMessage::new("phoenix", "heartbeat", serde_json::json!({}), msg_ref)
}

pub fn leave_message(topic: &str, msg_ref: String) -> PhoenixMessage {
    PhoenixMessage::new(topic, "phx_leave", serde_json::json!({}), msg_ref)
}

/// What an inbound message means to us
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Change(ChangeEvent),
    JoinAccepted,
    JoinRejected(String),
    ChannelError(String),
    Ignored,
}

fn change_kind(value: Option<&JsonValue>) -> Option<ChangeKind> {
    value.and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

/// Interpret a message received on the socket for the channel `topic`
pub fn classify(msg: &PhoenixMessage, topic: &str, table: &str) -> Incoming {
    if msg.topic != topic {
        return Incoming::Ignored;
    }

    match msg.event.as_str() {
        "postgres_changes" => {
            let data = msg.payload.get("data");
            let kind = change_kind(data.and_then(|d| d.get("type")));
            let changed_table = data
                .and_then(|d| d.get("table"))
                .and_then(|t| t.as_str())
                .unwrap_or(table);
            match kind {
                Some(kind) => Incoming::Change(ChangeEvent {
                    kind,
                    table: changed_table.to_string(),
                }),
                None => {
                    // The type is informational; any change invalidates
                    log::debug!("postgres_changes without a known type: {:?}", msg.payload);
                    Incoming::Change(ChangeEvent {
                        kind: ChangeKind::Update,
                        table: changed_table.to_string(),
                    })
                }
            }
        }
        "INSERT" | "UPDATE" | "DELETE" => match msg.event.parse() {
            Ok(kind) => Incoming::Change(ChangeEvent {
                kind,
                table: table.to_string(),
            }),
            Err(_) => Incoming::Ignored,
        },
        "phx_reply" if msg.msg_ref.as_deref() == Some(JOIN_REF) => {
            let status = msg.payload.get("status").and_then(|s| s.as_str());
            if status == Some("ok") {
                Incoming::JoinAccepted
            } else {
                let reason = msg.payload.get("response").unwrap_or(&msg.payload);
                Incoming::JoinRejected(reason.to_string())
            }
        }
        "phx_error" | "phx_close" => Incoming::ChannelError(msg.event.to_string()),
        "system" => {
            let status = msg.payload.get("status").and_then(|s| s.as_str());
            if status == Some("error") {
                Incoming::ChannelError(msg.payload.to_string())
            } else {
                Incoming::Ignored
            }
        }
        _ => Incoming::Ignored,
    }
}

/// Subscribes to postgres changes via the Realtime service of
/// a Supabase project
#[derive(Clone)]
pub struct SupabaseRealtime {
    base_url: String,
    key: String,
}

impl SupabaseRealtime {
    pub fn new<U: Into<String>, K: Into<String>>(base_url: U, key: K) -> Self {
        Self {
            base_url: base_url.into(),
            key: key.into(),
        }
    }

    pub fn for_client(client: &SupabaseClient) -> Self {
        Self::new(client.base_url(), client.key())
    }

    pub fn websocket_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("parsing project url {}", self.base_url))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => anyhow::bail!("unsupported scheme {other} in {}", self.base_url),
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("cannot use {scheme} with {}", self.base_url))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, table: &TableRef) -> anyhow::Result<Subscription> {
        let url = self.websocket_url()?;
        let host = url.host_str().unwrap_or("").to_string();
        let (mut socket, _response) = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .with_context(|| format!("timeout connecting to realtime service at {host}"))?
        .with_context(|| format!("failed to connect to realtime service at {host}"))?;

        let join = join_message(table);
        socket
            .send(join.to_message()?)
            .await
            .context("sending phx_join")?;
        log::info!("Subscribed to changes on {table} via {host}");

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let topic = join.topic.clone();
        let table_name = table.table.clone();

        let task = {
            let topic = topic.clone();
            tokio::spawn(async move {
                if let Err(err) = run_channel(socket, &topic, &table_name, tx, shutdown_rx).await {
                    log::error!("realtime channel {topic}: {err:#}");
                }
                log::info!("realtime channel {topic} terminated");
            })
        };

        Ok(Subscription {
            topic,
            events: rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

async fn leave_channel<S>(socket: &mut S, topic: &str, next_ref: u64) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    socket
        .send(leave_message(topic, next_ref.to_string()).to_message()?)
        .await
        .context("sending phx_leave")?;
    socket.close().await.ok();
    Ok(())
}

async fn run_channel<S>(
    mut socket: S,
    topic: &str,
    table: &str,
    tx: mpsc::Sender<ChangeEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let mut next_ref = 2u64;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                return leave_channel(&mut socket, topic, next_ref).await;
            }
            _ = heartbeat.tick() => {
                socket
                    .send(heartbeat_message(next_ref.to_string()).to_message()?)
                    .await
                    .context("sending heartbeat")?;
                next_ref += 1;
            }
            msg = socket.next() => {
                let text = match msg {
                    None => return Err(RealtimeError::ConnectionClosed.into()),
                    Some(Err(err)) => return Err(err).context("reading from realtime socket"),
                    Some(Ok(Message::Close(_))) => return Err(RealtimeError::ConnectionClosed.into()),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                let msg: PhoenixMessage = match from_json(text.as_bytes()) {
                    Ok(msg) => msg,
                    Err(err) => {
                        log::warn!("ignoring realtime message: {err:#}");
                        continue;
                    }
                };
                log::trace!("realtime: {msg:?}");

                match classify(&msg, topic, table) {
                    Incoming::Change(event) => {
                        log::debug!("realtime: {} on {}", event.kind, event.table);
                        if tx.send(event).await.is_err() {
                            // Nobody is listening any more
                            return leave_channel(&mut socket, topic, next_ref).await;
                        }
                    }
                    Incoming::JoinAccepted => {
                        log::debug!("realtime: joined {topic}");
                    }
                    Incoming::JoinRejected(reason) => {
                        return Err(RealtimeError::JoinRejected {
                            topic: topic.to_string(),
                            reason,
                        }
                        .into());
                    }
                    Incoming::ChannelError(reason) => {
                        return Err(RealtimeError::ChannelError {
                            topic: topic.to_string(),
                            reason,
                        }
                        .into());
                    }
                    Incoming::Ignored => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> PhoenixMessage {
        from_json(text).unwrap()
    }

    const TOPIC: &str = "realtime:public:devices";

    #[test]
    fn join_shape() {
        let join = serde_json::to_value(join_message(&TableRef::default())).unwrap();
        k9::assert_equal!(
            join,
            serde_json::json!({
                "topic": "realtime:public:devices",
                "event": "phx_join",
                "payload": {"config": {"postgres_changes": [
                    {"event": "*", "schema": "public", "table": "devices"}
                ]}},
                "ref": "1",
            })
        );
    }

    #[test]
    fn websocket_url() {
        let feed = SupabaseRealtime::new("https://abc.supabase.co", "anon");
        k9::assert_equal!(
            feed.websocket_url().unwrap().as_str(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        let feed = SupabaseRealtime::new("http://localhost:54321", "anon");
        k9::assert_equal!(
            feed.websocket_url().unwrap().as_str(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(SupabaseRealtime::new("ftp://nope", "k").websocket_url().is_err());
    }

    #[test]
    fn classify_changes() {
        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"postgres_changes",
                "payload":{"ids":[1],"data":{"schema":"public","table":"devices",
                "type":"UPDATE","record":{"id":"2","state":"on"}}},"ref":null}"#,
        );
        k9::assert_equal!(
            classify(&msg, TOPIC, "devices"),
            Incoming::Change(ChangeEvent {
                kind: ChangeKind::Update,
                table: "devices".to_string()
            })
        );

        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"DELETE","payload":{},"ref":null}"#,
        );
        k9::assert_equal!(
            classify(&msg, TOPIC, "devices"),
            Incoming::Change(ChangeEvent {
                kind: ChangeKind::Delete,
                table: "devices".to_string()
            })
        );

        let msg = parse(
            r#"{"topic":"realtime:public:other","event":"INSERT","payload":{},"ref":null}"#,
        );
        k9::assert_equal!(classify(&msg, TOPIC, "devices"), Incoming::Ignored);
    }

    #[test]
    fn untyped_changes_still_count() {
        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"postgres_changes",
                "payload":{"data":{"table":"devices","type":"TRUNCATE"}},"ref":null}"#,
        );
        k9::assert_equal!(
            classify(&msg, TOPIC, "devices"),
            Incoming::Change(ChangeEvent {
                kind: ChangeKind::Update,
                table: "devices".to_string()
            })
        );

        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"postgres_changes","payload":{},"ref":null}"#,
        );
        k9::assert_equal!(
            classify(&msg, TOPIC, "devices"),
            Incoming::Change(ChangeEvent {
                kind: ChangeKind::Update,
                table: "devices".to_string()
            })
        );
    }

    #[test]
    fn classify_replies() {
        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"phx_reply",
                "payload":{"status":"ok","response":{}},"ref":"1"}"#,
        );
        k9::assert_equal!(classify(&msg, TOPIC, "devices"), Incoming::JoinAccepted);

        let msg = parse(
            r#"{"topic":"realtime:public:devices","event":"phx_reply",
                "payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#,
        );
        k9::assert_equal!(
            classify(&msg, TOPIC, "devices"),
            Incoming::JoinRejected(r#"{"reason":"unauthorized"}"#.to_string())
        );

        // heartbeat replies are on the phoenix topic
        let msg = parse(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#,
        );
        k9::assert_equal!(classify(&msg, TOPIC, "devices"), Incoming::Ignored);
    }

    #[tokio::test]
    async fn subscribe_receive_and_leave() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut seen = vec![];
            let Some(Ok(Message::Text(join))) = ws.next().await else {
                panic!("expected join");
            };
            let join: PhoenixMessage = from_json(join.as_bytes()).unwrap();
            seen.push(join.event.clone());

            let reply = serde_json::json!({
                "topic": join.topic, "event": "phx_reply",
                "payload": {"status": "ok", "response": {}}, "ref": "1"
            });
            ws.send(Message::Text(reply.to_string())).await.unwrap();
            let change = serde_json::json!({
                "topic": join.topic, "event": "postgres_changes",
                "payload": {"data": {"table": "devices", "type": "INSERT"}}, "ref": null
            });
            ws.send(Message::Text(change.to_string())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let msg: PhoenixMessage = from_json(text.as_bytes()).unwrap();
                    seen.push(msg.event);
                }
            }
            seen
        });

        let feed = SupabaseRealtime::new(format!("http://{addr}"), "anon");
        let mut sub = feed.subscribe(&TableRef::default()).await.unwrap();
        k9::assert_equal!(sub.topic(), TOPIC);

        let event = timeout(Duration::from_secs(5), sub.next())
            .await
            .unwrap()
            .unwrap();
        k9::assert_equal!(event.kind, ChangeKind::Insert);

        sub.close().await;
        let seen = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        k9::assert_equal!(seen, vec!["phx_join".to_string(), "phx_leave".to_string()]);
    }
}
