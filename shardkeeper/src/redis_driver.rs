use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, ErrorKind, FromRedisValue, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::address::{NodeAddress, NodeAddressMap};
use crate::connection::{Driver, LifecycleSink, Listener, Session};
use crate::factory::{ConnectionMode, ConnectionParams};
use crate::topology::{SlotRange, TopologySnapshot};
use crate::{lock, Error};

/// Opens sessions against real Redis deployments.
#[derive(Debug, Default, Clone)]
pub struct RedisDriver;

impl RedisDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for RedisDriver {
    async fn open(
        &self,
        params: &ConnectionParams,
        sink: LifecycleSink,
    ) -> Result<Arc<dyn Session>, Error> {
        let opening = async {
            let session: Arc<dyn Session> = match &params.mode {
                ConnectionMode::Standalone => Arc::new(StandaloneSession::open(params, sink).await?),
                ConnectionMode::Cluster { node_address_map } => {
                    Arc::new(ClusterSession::open(params, node_address_map.clone()).await?)
                }
            };
            Ok::<_, Error>(session)
        };

        match tokio::time::timeout(params.command_timeout, opening).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "connect to {} timed out after {}ms",
                params.address(),
                params.command_timeout.as_millis()
            ))),
        }
    }
}

/// Build a `redis://` or `rediss://` URL for `host:port` with the
/// credentials and database of `params`.
pub fn connection_url(params: &ConnectionParams, host: &str, port: u16) -> String {
    let scheme = if params.tls { "rediss" } else { "redis" };
    let auth = match (&params.username, &params.password) {
        (Some(user), Some(pass)) => format!(
            "{}:{}@",
            urlencoding::encode(user),
            urlencoding::encode(pass)
        ),
        (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
        (Some(user), None) => format!("{}@", urlencoding::encode(user)),
        (None, None) => String::new(),
    };
    let database = params
        .database
        .map(|db| format!("/{}", db))
        .unwrap_or_default();
    format!("{}://{}{}:{}{}", scheme, auth, host, port, database)
}

struct SubscribeRequest {
    channel: String,
    reply: oneshot::Sender<Result<(), Error>>,
}

type ListenerMap = Arc<Mutex<HashMap<String, Vec<Listener>>>>;

/// One node: a multiplexed command connection plus, once something
/// subscribes, a dedicated Pub/Sub connection driven by a reader task.
struct StandaloneSession {
    address: NodeAddress,
    client: Client,
    commands: ConnectionManager,
    subscriptions: tokio::sync::Mutex<Option<mpsc::Sender<SubscribeRequest>>>,
    listeners: ListenerMap,
    sink: LifecycleSink,
    cancel_token: CancellationToken,
}

impl StandaloneSession {
    async fn open(params: &ConnectionParams, sink: LifecycleSink) -> Result<Self, Error> {
        let client = Client::open(connection_url(params, &params.host, params.port))?;
        let mut commands = client.get_connection_manager().await?;
        redis::cmd("PING").query_async::<()>(&mut commands).await?;

        Ok(Self {
            address: params.address(),
            client,
            commands,
            subscriptions: tokio::sync::Mutex::new(None),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            sink,
            cancel_token: CancellationToken::new(),
        })
    }

    async fn subscriber(&self) -> Result<mpsc::Sender<SubscribeRequest>, Error> {
        let mut slot = self.subscriptions.lock().await;
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        let pubsub = self.client.get_async_pubsub().await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_pubsub_loop(
            pubsub,
            rx,
            self.listeners.clone(),
            self.cancel_token.clone(),
            self.sink.clone(),
            self.address.clone(),
        ));
        *slot = Some(tx.clone());
        Ok(tx)
    }
}

async fn run_pubsub_loop(
    mut pubsub: PubSub,
    mut requests: mpsc::Receiver<SubscribeRequest>,
    listeners: ListenerMap,
    cancel_token: CancellationToken,
    sink: LifecycleSink,
    address: NodeAddress,
) {
    loop {
        let request = {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::debug!(node = %address, "Pub/Sub task shutting down");
                        return;
                    }
                    request = requests.recv() => match request {
                        Some(request) => break request,
                        None => return,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => dispatch(&listeners, &msg),
                        None => {
                            if !cancel_token.is_cancelled() {
                                sink.report_error(format!("Pub/Sub stream to {} ended", address));
                            }
                            return;
                        }
                    },
                }
            }
        };

        let result = pubsub.subscribe(&request.channel).await.map_err(Error::from);
        if let Err(e) = &result {
            tracing::warn!(node = %address, channel = %request.channel, "Subscribe failed: {}", e);
        } else {
            tracing::debug!(node = %address, channel = %request.channel, "Subscribed");
        }
        let _ = request.reply.send(result);
    }
}

fn dispatch(listeners: &ListenerMap, msg: &redis::Msg) {
    let channel = msg.get_channel_name();
    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(channel, "Failed to get Pub/Sub payload: {}", e);
            return;
        }
    };
    let targets: Vec<Listener> = lock(listeners).get(channel).cloned().unwrap_or_default();
    for listener in targets {
        listener.call(&payload, channel);
    }
}

#[async_trait]
impl Session for StandaloneSession {
    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.commands.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.commands.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.commands.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.commands.clone();
        Ok(conn.del::<_, u64>(key).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, Error> {
        let mut conn = self.commands.clone();
        Ok(conn.publish::<_, _, u64>(channel, message).await?)
    }

    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<(), Error> {
        let first = {
            let mut listeners = lock(&self.listeners);
            let entry = listeners.entry(channel.to_string()).or_default();
            entry.push(listener);
            entry.len() == 1
        };
        if !first {
            return Ok(());
        }

        let result = async {
            let tx = self.subscriber().await?;
            let (reply, response) = oneshot::channel();
            tx.send(SubscribeRequest {
                channel: channel.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::Connection(format!("Pub/Sub connection to {} is gone", self.address)))?;
            response
                .await
                .map_err(|_| Error::Connection(format!("Pub/Sub connection to {} is gone", self.address)))?
        }
        .await;

        if result.is_err() {
            lock(&self.listeners).remove(channel);
        }
        result
    }

    async fn cluster_slots(&self) -> Result<TopologySnapshot, Error> {
        let mut conn = self.commands.clone();
        let reply = redis::cmd("CLUSTER")
            .arg("SLOTS")
            .query_async::<Value>(&mut conn)
            .await?;
        parse_cluster_slots(&reply)
    }

    async fn close(&self) -> Result<(), Error> {
        self.cancel_token.cancel();
        *self.subscriptions.lock().await = None;
        Ok(())
    }
}

struct ClusterRoutes {
    snapshot: TopologySnapshot,
    nodes: HashMap<u16, ConnectionManager>,
}

/// Slot-aware routing over one connection per master.
struct ClusterSession {
    params: ConnectionParams,
    node_address_map: NodeAddressMap,
    seed: ConnectionManager,
    routes: RwLock<ClusterRoutes>,
}

impl ClusterSession {
    async fn open(params: &ConnectionParams, node_address_map: NodeAddressMap) -> Result<Self, Error> {
        let client = Client::open(connection_url(params, &params.host, params.port))?;
        let seed = client.get_connection_manager().await?;
        let session = Self {
            params: params.clone(),
            node_address_map,
            seed,
            routes: RwLock::new(ClusterRoutes {
                snapshot: TopologySnapshot::default(),
                nodes: HashMap::new(),
            }),
        };
        session.refresh().await?;
        Ok(session)
    }

    async fn refresh(&self) -> Result<(), Error> {
        let mut seed = self.seed.clone();
        let reply = redis::cmd("CLUSTER")
            .arg("SLOTS")
            .query_async::<Value>(&mut seed)
            .await?;
        let map = &self.node_address_map;
        let snapshot = parse_cluster_slots(&reply)?.map_nodes(|n| map(&n.to_string()));
        if snapshot.is_empty() {
            return Err(Error::Topology("cluster reported no slot ranges".to_string()));
        }

        let existing = {
            let routes = self.routes.read().await;
            routes.nodes.clone()
        };
        let mut nodes = HashMap::new();
        for node in snapshot.nodes() {
            let conn = match existing.get(&node.port) {
                Some(conn) => conn.clone(),
                None => self.connect_node(&node).await?,
            };
            nodes.insert(node.port, conn);
        }

        tracing::debug!(masters = nodes.len(), "Refreshed cluster routing table");
        *self.routes.write().await = ClusterRoutes { snapshot, nodes };
        Ok(())
    }

    async fn connect_node(&self, node: &NodeAddress) -> Result<ConnectionManager, Error> {
        let mut params = self.params.clone();
        params.database = None;
        let client = Client::open(connection_url(&params, &node.host, node.port))?;
        Ok(client.get_connection_manager().await?)
    }

    async fn connection_for(&self, key: &str) -> Result<ConnectionManager, Error> {
        let routes = self.routes.read().await;
        let owner = routes
            .snapshot
            .node_for_key(key.as_bytes())
            .ok_or_else(|| Error::Topology(format!("no master serves key {}", key)))?;
        routes
            .nodes
            .get(&owner.port)
            .cloned()
            .ok_or_else(|| Error::Topology(format!("no connection to {}", owner)))
    }

    async fn routed<T>(&self, key: &str, cmd: redis::Cmd) -> Result<T, Error>
    where
        T: FromRedisValue + Send,
    {
        let mut conn = self.connection_for(key).await?;
        match cmd.query_async::<T>(&mut conn).await {
            Err(e) if e.kind() == ErrorKind::Moved => {
                tracing::debug!(key, "Slot moved, refreshing routing table");
                self.refresh().await?;
                let mut conn = self.connection_for(key).await?;
                Ok(cmd.query_async::<T>(&mut conn).await?)
            }
            other => Ok(other?),
        }
    }
}

#[async_trait]
impl Session for ClusterSession {
    async fn ping(&self) -> Result<(), Error> {
        let masters: Vec<ConnectionManager> = self.routes.read().await.nodes.values().cloned().collect();
        let results = join_all(masters.into_iter().map(|mut conn| async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        }))
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.routed(key, cmd).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
        self.routed(key, cmd).await
    }

    async fn del(&self, key: &str) -> Result<u64, Error> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.routed(key, cmd).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, Error> {
        let mut seed = self.seed.clone();
        Ok(seed.publish::<_, _, u64>(channel, message).await?)
    }

    async fn subscribe(&self, _channel: &str, _listener: Listener) -> Result<(), Error> {
        Err(Error::Unsupported(
            "subscribe on a cluster-routed connection; use ClusterSubscriber".to_string(),
        ))
    }

    async fn cluster_slots(&self) -> Result<TopologySnapshot, Error> {
        let mut seed = self.seed.clone();
        let reply = redis::cmd("CLUSTER")
            .arg("SLOTS")
            .query_async::<Value>(&mut seed)
            .await?;
        parse_cluster_slots(&reply)
    }

    async fn close(&self) -> Result<(), Error> {
        self.routes.write().await.nodes.clear();
        Ok(())
    }
}

/// Parse a `CLUSTER SLOTS` reply. Replica entries are ignored.
pub fn parse_cluster_slots(reply: &Value) -> Result<TopologySnapshot, Error> {
    let Value::Array(entries) = reply else {
        return Err(Error::Topology(format!("unexpected CLUSTER SLOTS reply: {:?}", reply)));
    };

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(fields) = entry else {
            return Err(Error::Topology(format!("unexpected slot entry: {:?}", entry)));
        };
        let (Some(from), Some(to), Some(Value::Array(master))) =
            (fields.first().and_then(as_int), fields.get(1).and_then(as_int), fields.get(2))
        else {
            return Err(Error::Topology(format!("malformed slot entry: {:?}", entry)));
        };
        let (Some(host), Some(port)) = (
            master.first().and_then(as_text),
            master.get(1).and_then(as_int),
        ) else {
            return Err(Error::Topology(format!("malformed master entry: {:?}", master)));
        };

        let (Ok(from), Ok(to), Ok(port)) = (u16::try_from(from), u16::try_from(to), u16::try_from(port)) else {
            return Err(Error::Topology(format!("slot entry out of range: {:?}", entry)));
        };
        ranges.push(SlotRange::new(from, to, NodeAddress::new(host, port)));
    }
    Ok(TopologySnapshot::new(ranges))
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::SimpleString(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
