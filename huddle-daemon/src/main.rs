//! Huddle Daemon (`huddled`)
//!
//! Runs a simulated multi-peer session on the in-memory network and drives
//! a scripted workload against the shared counter and a rotation cohort.

use clap::Parser;
use huddle_engine::{AccessPolicies, EngineConfig, EngineError, Session};
use huddle_model::{Peer, ResourceId};
use huddle_net_sim::{BroadcastPubSub, BusNetwork, StoreNetwork};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const COUNTER: &str = "pool";
const COHORT: &str = "party";

#[derive(Parser, Debug)]
#[command(name = "huddled", version, about = "Huddle simulated session daemon")]
struct Args {
    /// Number of simulated peers
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=64))]
    peers: u32,

    /// Run without any authority candidate
    #[arg(long)]
    authority_offline: bool,

    /// Workload rounds to run
    #[arg(long, default_value_t = 5)]
    rounds: u32,

    /// Reconciler debounce window in milliseconds
    #[arg(long, default_value_t = 100)]
    debounce_ms: u64,

    /// RPC timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    rpc_timeout_ms: u64,

    /// Seed for picking actors (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("huddled v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::default()
        .with_debounce(Duration::from_millis(args.debounce_ms))
        .with_rpc_timeout(Duration::from_millis(args.rpc_timeout_ms));
    let sim = Simulation::start(&args, config).await.map_err(|e| {
        tracing::error!("Failed to start: {}", e);
        anyhow::anyhow!("{}", e)
    })?;

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    tracing::info!(peers = sim.sessions.len(), rounds = args.rounds, "Simulation ready. Press Ctrl+C to stop.");
    tokio::select! {
        _ = sim.run(args.rounds, rng) => tracing::info!("Workload finished"),
        _ = shutdown_signal() => tracing::info!("Shutdown signal received..."),
    }

    sim.shutdown().await;
    tracing::info!("Daemon stopped");
    Ok(())
}

/// Every simulated peer on one bus and one store.
struct Simulation {
    sessions: Vec<Arc<Session>>,
    pubsubs: Vec<Arc<BroadcastPubSub>>,
    settle: Duration,
}

impl Simulation {
    async fn start(args: &Args, config: EngineConfig) -> Result<Self, EngineError> {
        let bus = BusNetwork::new();
        let store = StoreNetwork::new();
        let peers = roster(args.peers, args.authority_offline);

        // The store lets the privileged peers write the shared resources
        for resource in [COUNTER, COHORT] {
            let writers: Vec<_> = peers
                .iter()
                .filter(|p| p.is_privileged_for(&ResourceId::new(resource)))
                .map(|p| p.id.clone())
                .collect();
            store.restrict(resource, writers);
        }

        let settle = config.debounce * 2 + Duration::from_millis(50);
        let mut sessions = Vec::new();
        let mut pubsubs = Vec::new();
        for peer in peers {
            let pubsub = Arc::new(BroadcastPubSub::new(peer.id.clone(), &bus));
            let session = Session::builder(peer.clone())
                .with_config(config.clone())
                .with_store(Arc::new(store.view(peer.id.clone())))
                .with_pubsub(pubsub.clone())
                .build()
                .await?;
            session.open_counter(COUNTER, AccessPolicies::default()).await?;
            session.open_cohort(COHORT, AccessPolicies::default())?;
            sessions.push(session);
            pubsubs.push(pubsub);
        }
        // Let Hello and heartbeat replies land before anyone elects
        tokio::time::sleep(settle).await;

        let sim = Self { sessions, pubsubs, settle };
        sim.seed_cohort().await?;
        Ok(sim)
    }

    /// Make every peer's character a cohort member, through whoever writes it.
    async fn seed_cohort(&self) -> Result<(), EngineError> {
        let members: Vec<ResourceId> = self.sessions.iter().map(|s| character(s.local())).collect();
        for session in &self.sessions {
            let Some(cohort) = session.cohort(&ResourceId::new(COHORT)) else { continue };
            if cohort.is_writer() {
                let outcome = cohort.set_members(members.clone()).await?;
                tracing::info!(writer = %session.local().id, ?outcome, "Cohort seeded");
                return Ok(());
            }
        }
        tracing::warn!("Nobody may write the cohort, rotation actions will be rejected");
        Ok(())
    }

    async fn run(&self, rounds: u32, mut rng: StdRng) {
        let counter_id = ResourceId::new(COUNTER);
        let cohort_id = ResourceId::new(COHORT);

        for round in 1..=rounds {
            let actor = &self.sessions[rng.gen_range(0..self.sessions.len())];
            let delta = rng.gen_range(-2..=3);
            let key = format!("{}-{}", actor.local().id, round);
            match actor.submit_counter_change(&counter_id, delta, Some(key)).await {
                Ok(state) => tracing::info!(round, peer = %actor.local().id, delta, value = state.value, "Counter changed"),
                Err(e) => tracing::warn!(round, peer = %actor.local().id, delta, "Counter change failed: {}", e.user_message()),
            }

            let actor = &self.sessions[rng.gen_range(0..self.sessions.len())];
            let entity = character(actor.local());
            match actor.submit_record_action(&cohort_id, &entity).await {
                Ok(outcome) => tracing::info!(round, peer = %actor.local().id, entity = %entity, ?outcome, "Rotation action"),
                Err(e) => tracing::warn!(round, peer = %actor.local().id, "Rotation action failed: {}", e.user_message()),
            }

            tokio::time::sleep(self.settle).await;
            self.log_state(round).await;
        }
    }

    async fn log_state(&self, round: u32) {
        let counter_id = ResourceId::new(COUNTER);
        let values: Vec<i64> = self
            .sessions
            .iter()
            .filter_map(|s| s.counter(&counter_id).map(|c| c.get()))
            .collect();
        let converged = values.windows(2).all(|w| w[0] == w[1]);
        tracing::info!(round, ?values, converged, "Counter caches");

        let Some(cohort) = self.sessions.first().and_then(|s| s.cohort(&ResourceId::new(COHORT))) else {
            return;
        };
        match cohort.table().await {
            Ok(table) => match serde_json::to_string(&table) {
                Ok(json) => tracing::info!(round, table = %json, "Cohort cooldowns"),
                Err(e) => tracing::warn!(round, error = %e, "Could not encode cohort table"),
            },
            Err(e) => tracing::warn!(round, error = %e, "Could not read cohort table"),
        }
    }

    async fn shutdown(&self) {
        for session in &self.sessions {
            session.shutdown().await;
        }
        for pubsub in &self.pubsubs {
            pubsub.shutdown();
        }
    }
}

/// `peer-0` is the authority unless it is offline; `peer-1` (or the only
/// peer) owns the shared resources so something can still write them.
fn roster(count: u32, authority_offline: bool) -> Vec<Peer> {
    let owner = if count > 1 { 1 } else { 0 };
    (0..count)
        .map(|i| {
            let id = format!("peer-{}", i);
            let mut peer = if i == 0 && !authority_offline { Peer::authority(id) } else { Peer::new(id) };
            if i == owner {
                peer = peer.with_owned(COUNTER).with_owned(COHORT);
            }
            peer
        })
        .collect()
}

fn character(peer: &Peer) -> ResourceId {
    ResourceId::new(format!("character:{}", peer.id))
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    }
}
