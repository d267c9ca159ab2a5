use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mall_presence::config::PresenceConfig;
use mall_presence::metrics::{self, Metrics};
use mall_presence::net::memory::{MemoryHub, MemoryStore, MemoryTransport};
use mall_presence::presence::{
    ActiveSessions, ParticipantRegistry, PositionSample, SessionLifecycle, SyncEvent,
};
use mall_presence::store::layout::{facing, plan_to_world, world_to_plan};
use mall_presence::store::spatial::OBJECT_GRID_CELL_SIZE;
use mall_presence::store::{shelf_layout, Product, ProximityChange, ProximityTracker, SpatialIndex, TickGate};
use mall_presence::util::time::now_millis;
use mall_presence::util::vec2::Vec2;

/// Simulated shoppers walking the floor
const SHOPPERS: usize = 3;

/// Render-loop cadence; the tick gate decides which frames become samples
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Walking speed in world units per second
const WALK_SPEED: f32 = 3.0;

/// How often each shopper logs who it can see
const ROSTER_INTERVAL: Duration = Duration::from_secs(5);

/// Walkable floor in world (x, z)
const FLOOR_MIN: Vec2 = Vec2 { x: -9.0, y: -10.0 };
const FLOOR_MAX: Vec2 = Vec2 { x: 9.0, y: 6.0 };

type DemoLifecycle = SessionLifecycle<MemoryTransport, MemoryStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Mall Presence v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = PresenceConfig::load_or_default();
    config.validate().context("invalid presence configuration")?;
    info!(
        "Configuration loaded: channel={}, table={}, threshold={}, durable_interval={}ms",
        config.presence_channel,
        config.presence_table,
        config.movement_threshold,
        config.durable_interval_ms()
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9090);

    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // In-process realtime service and presence table
    let hub = MemoryHub::new();
    let store = Arc::new(MemoryStore::new(&[config.presence_table.as_str()]));
    let sessions = ActiveSessions::new();

    let catalog = catalog();
    let index = Arc::new(SpatialIndex::from_objects(
        shelf_layout(&catalog, config.proximity_radius),
        OBJECT_GRID_CELL_SIZE,
    ));
    info!(
        "Store floor ready: {} products in {} grid cells",
        index.len(),
        index.stats().non_empty_cells
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut shoppers = Vec::with_capacity(SHOPPERS);

    for n in 0..SHOPPERS {
        let id = format!("shopper-{}", n + 1);
        let lifecycle = SessionLifecycle::new(
            config.clone(),
            Arc::new(hub.connect(id.clone())),
            store.clone(),
            metrics.clone(),
        )?
        .with_sessions(sessions.clone());

        tokio::spawn(log_events(id.clone(), lifecycle.subscribe_events()));

        let shopper = Shopper {
            name: format!("Shopper {}", n + 1),
            id,
            lifecycle,
            index: index.clone(),
            catalog: catalog.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown_rx.clone(),
        };
        shoppers.push(tokio::spawn(shopper.run()));
    }

    // Shutdown signal handler
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in shoppers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Shopper failed: {:#}", e),
            Err(e) => error!("Shopper task panicked: {}", e),
        }
    }

    info!(
        "Stopped: {} broadcasts, {} durable writes, {} samples suppressed",
        metrics.broadcasts_sent.load(Ordering::Relaxed),
        metrics.durable_writes.load(Ordering::Relaxed),
        metrics.samples_suppressed.load(Ordering::Relaxed)
    );

    Ok(())
}

fn catalog() -> Vec<Product> {
    [
        ("denim-jacket", "Denim Jacket", 8900),
        ("wool-scarf", "Wool Scarf", 2500),
        ("canvas-tote", "Canvas Tote", 1800),
        ("leather-belt", "Leather Belt", 3400),
        ("rain-boots", "Rain Boots", 6200),
        ("linen-shirt", "Linen Shirt", 4500),
        ("sun-hat", "Sun Hat", 2900),
        ("trail-socks", "Trail Socks", 1200),
        ("knit-beanie", "Knit Beanie", 2200),
        ("chino-shorts", "Chino Shorts", 3900),
        ("silk-tie", "Silk Tie", 3100),
        ("travel-mug", "Travel Mug", 1600),
    ]
    .into_iter()
    .map(|(id, name, price)| Product::new(id, name, price))
    .collect()
}

async fn log_events(id: String, mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(SyncEvent::PeerJoined { id: peer }) => info!("[{}] {} walked in", id, peer),
            Ok(SyncEvent::PeerDeparted { id: peer }) => info!("[{}] {} left the store", id, peer),
            Ok(SyncEvent::InboundFault { error, .. }) => warn!("[{}] Inbound event dropped: {}", id, error),
            Ok(SyncEvent::InboundStopped { error, .. }) => error!("[{}] Stopped following the room: {}", id, error),
            Ok(SyncEvent::SessionStopped { .. }) => break,
            Ok(event) => debug!("[{}] {:?}", id, event),
            Err(RecvError::Lagged(skipped)) => warn!("[{}] Event log lagged by {}", id, skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// One simulated participant wandering between random waypoints
struct Shopper {
    id: String,
    name: String,
    lifecycle: DemoLifecycle,
    index: Arc<SpatialIndex>,
    catalog: Vec<Product>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl Shopper {
    async fn run(mut self) -> anyhow::Result<()> {
        let config = self.lifecycle.config().clone();
        let mut rng = StdRng::from_entropy();

        let spawn = PositionSample::idle(config.spawn_position, config.spawn_direction, now_millis());
        let registry = ParticipantRegistry::new();
        let mut session = self
            .lifecycle
            .start(&self.id, &self.name, spawn, registry.clone())
            .await
            .with_context(|| format!("{} could not join", self.id))?;

        let mut world = plan_to_world(config.spawn_position);
        let mut target = random_point(&mut rng);
        let mut gate = TickGate::new(config.tick_interval);
        let mut tracker = ProximityTracker::new();
        let mut frames = tokio::time::interval(FRAME_INTERVAL);
        let mut last_frame = Instant::now();
        let mut last_roster = Instant::now();

        loop {
            tokio::select! {
                _ = frames.tick() => {}
                _ = self.shutdown.changed() => break,
            }

            let frame_start = Instant::now();
            let dt = frame_start.duration_since(last_frame).as_secs_f32();
            last_frame = frame_start;

            let to_target = target - world;
            let remaining = to_target.length();
            let stride = WALK_SPEED * dt;
            let step = if remaining <= stride {
                target = random_point(&mut rng);
                to_target
            } else {
                to_target * (stride / remaining)
            };
            world += step;

            if !gate.admit(frame_start) {
                continue;
            }

            let direction = facing(step).unwrap_or(config.spawn_direction);
            let sample = PositionSample::new(world_to_plan(world), direction, true, now_millis());
            session.update(sample);

            if let Some(change) = tracker.observe(self.index.nearest(world, config.proximity_radius)) {
                Metrics::incr(&self.metrics.proximity_changes);
                self.log_proximity(&change);
            }

            if last_roster.elapsed() >= ROSTER_INTERVAL {
                last_roster = Instant::now();
                let peers: Vec<String> = registry.snapshot().into_iter().map(|p| p.name).collect();
                info!("[{}] sees {} peers: {:?}", self.id, peers.len(), peers);
            }

            self.metrics.record_tick_time(frame_start.elapsed());
        }

        info!("[{}] heading for the exit", self.id);
        session.stop().await;
        Ok(())
    }

    fn log_proximity(&self, change: &ProximityChange) {
        let name = |id: &str| {
            self.catalog
                .iter()
                .find(|p| p.id == id)
                .map_or_else(|| id.to_string(), |p| p.name.clone())
        };
        match change {
            ProximityChange::Entered(id) => info!("[{}] browsing {}", self.id, name(id)),
            ProximityChange::Switched { to, .. } => info!("[{}] moved on to {}", self.id, name(to)),
            ProximityChange::Left(id) => debug!("[{}] walked away from {}", self.id, name(id)),
        }
    }
}

fn random_point(rng: &mut StdRng) -> Vec2 {
    Vec2::new(
        rng.gen_range(FLOOR_MIN.x..FLOOR_MAX.x),
        rng.gen_range(FLOOR_MIN.y..FLOOR_MAX.y),
    )
}
