// Wires every shardkeeper component from the environment, publishes a
// notification to itself and listens for expired keys until shut down.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use shardkeeper::{
    ClusterConnectionKeeper, ClusterSubscriber, ConnectionFactory, ConnectionHandle,
    ConnectionKeeper, Error, KeeperConfig, LazyConnection, Listener, TopologyMonitor,
    TopologySubscription,
};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BROADCAST_CHANNEL: &str = "broadcast";
const DEMO_KEY_TTL: Duration = Duration::from_secs(1);

/// JSON message format for the broadcast channel
#[derive(Serialize, Deserialize, Debug)]
struct Notification {
    id: String,
    message: String,
    sent_at_ms: u64,
}

/// Where channel subscriptions live: one connection per shard in cluster
/// mode, a single connection otherwise.
enum Subscriptions {
    Cluster {
        monitor: TopologyMonitor,
        subscriber: ClusterSubscriber,
        _attachments: Vec<TopologySubscription>,
    },
    Standalone(ConnectionHandle),
}

impl Subscriptions {
    async fn subscribe(&self, channel: &str, listener: Listener) -> Result<(), Error> {
        match self {
            Subscriptions::Cluster { subscriber, .. } => {
                subscriber.subscribe(channel, listener).await;
                Ok(())
            }
            Subscriptions::Standalone(handle) => handle.subscribe(channel, listener).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Subscriptions::Cluster {
                monitor, subscriber, ..
            } => {
                monitor.shutdown().await;
                subscriber.disconnect().await;
            }
            Subscriptions::Standalone(handle) => {
                if let Err(e) = handle.disconnect().await {
                    tracing::warn!("Disconnect subscriber failed: {}", e);
                }
            }
        }
    }
}

fn app_connection(
    factory: ConnectionFactory,
    config: &KeeperConfig,
    keeper: Arc<ConnectionKeeper>,
    cluster_keeper: Arc<ClusterConnectionKeeper>,
) -> LazyConnection {
    let cluster = config.redis.cluster;
    let (setup_keepers, dispose_keepers) = (
        (keeper.clone(), cluster_keeper.clone()),
        (keeper, cluster_keeper),
    );

    LazyConnection::new(
        "app",
        move || {
            let handle = if cluster {
                factory.cluster("app")
            } else {
                factory.standalone("app")
            };
            async move { Ok::<_, Error>(handle) }
        },
        move |handle: ConnectionHandle| {
            let (keeper, cluster_keeper) = setup_keepers.clone();
            async move {
                handle.connect().await?;
                if cluster {
                    cluster_keeper.add(&handle);
                } else {
                    keeper.add(&handle);
                }
                Ok::<(), Error>(())
            }
        },
    )
    .with_config(config)
    .with_dispose(move |handle: ConnectionHandle| {
        let (keeper, cluster_keeper) = dispose_keepers.clone();
        async move {
            keeper.remove(&handle);
            cluster_keeper.remove(&handle);
            handle.disconnect().await
        }
    })
}

fn broadcast_listener() -> Listener {
    Listener::new(|payload, channel| {
        match serde_json::from_str::<Notification>(payload) {
            Ok(notification) => tracing::info!(
                channel,
                id = %notification.id,
                sent_at_ms = notification.sent_at_ms,
                "Received notification: {}",
                notification.message
            ),
            Err(e) => tracing::warn!(channel, "Failed to parse notification: {}", e),
        }
    })
}

fn expired_listener() -> Listener {
    Listener::new(|key, channel| {
        tracing::info!(channel, key, "Key expired");
    })
}

async fn publish_demo(app: &LazyConnection, config: &KeeperConfig) -> Result<(), Error> {
    let connection = app.get_connection().await?;

    let notification = Notification {
        id: uuid::Uuid::new_v4().to_string(),
        message: "Hello world".to_string(),
        sent_at_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default(),
    };
    let payload = match serde_json::to_string(&notification) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(id = %notification.id, "Failed to encode notification: {}", e);
            return Ok(());
        }
    };
    let receivers = connection.publish(BROADCAST_CHANNEL, &payload).await?;
    tracing::info!(receivers, id = %notification.id, "Published notification");

    // Fires an expired event if the server has keyspace notifications on
    let key = config.redis.prefixed(&format!("demo:{}", notification.id));
    connection.set_ex(&key, "expiring", DEMO_KEY_TTL).await?;
    tracing::info!(key = %key, ttl_secs = DEMO_KEY_TTL.as_secs(), "Stored expiring key");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // JSON logs in production for log aggregation
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = match KeeperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Configuration Error:\n{}\n", e);
            std::process::exit(1);
        }
    };
    tracing::info!(settings = ?config.redis, "Starting shardkeeper demo");

    let factory = ConnectionFactory::redis(&config);
    let keeper = Arc::new(ConnectionKeeper::from_config(&config));
    let cluster_keeper = Arc::new(ClusterConnectionKeeper::new(factory.clone(), &config));
    let app = app_connection(factory.clone(), &config, keeper.clone(), cluster_keeper.clone());

    let subscriptions = if config.redis.cluster {
        let monitor = TopologyMonitor::from_config(factory.clone(), &config);
        let subscriber = ClusterSubscriber::new(factory.clone());
        let attachments = vec![subscriber.attach(&monitor), cluster_keeper.attach(&monitor)];
        monitor.start();
        cluster_keeper.start();
        Subscriptions::Cluster {
            monitor,
            subscriber,
            _attachments: attachments,
        }
    } else {
        let handle = factory.standalone("subscriber");
        handle.connect().await?;
        keeper.add(&handle);
        Subscriptions::Standalone(handle)
    };
    keeper.start();

    let database = if config.redis.cluster {
        0
    } else {
        config.redis.database.unwrap_or(0)
    };
    let expired_channel = format!("__keyevent@{}__:expired", database);

    subscriptions
        .subscribe(BROADCAST_CHANNEL, broadcast_listener())
        .await?;
    subscriptions
        .subscribe(&expired_channel, expired_listener())
        .await?;
    tracing::info!(channels = ?[BROADCAST_CHANNEL, expired_channel.as_str()], "Listening");

    if let Err(e) = publish_demo(&app, &config).await {
        tracing::error!("Publish demo notification failed: {}", e);
    }

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down gracefully...");

    subscriptions.shutdown().await;
    keeper.shutdown().await;
    cluster_keeper.shutdown().await;
    if let Err(e) = app.reset_connection().await {
        tracing::warn!("Close app connection failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
