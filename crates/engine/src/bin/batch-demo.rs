//! Drives a registry through a fixed number of ticks with a follow kernel:
//! every child body is moved to its parent's position plus an offset.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobit_engine::{
    BatchKernel, DependencyHandle, EngineConfig, JobError, JobRegistry, Owner, OwnerKey, Phase,
    RegisteredJob, SharedLane, WorkerPool,
};

/// Batch a set of parent/child bodies and keep children attached.
#[derive(Parser, Debug)]
#[command(name = "batch-demo", about = "Run the batching engine over synthetic bodies")]
struct Args {
    /// Number of parent/child pairs
    #[arg(long, default_value = "1000")]
    owners: usize,

    /// Ticks to simulate
    #[arg(long, default_value = "60")]
    ticks: usize,

    /// Worker thread override (0 = available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Path to an engine config TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Retire one child and withdraw another every N ticks (0 = never)
    #[arg(long, default_value = "10")]
    retire_every: usize,
}

type Vec3 = [f32; 3];

struct Body {
    key: OwnerKey,
    alive: AtomicBool,
    position: Mutex<Vec3>,
}

impl Body {
    fn new(key: u64, position: Vec3) -> Arc<Self> {
        Arc::new(Self {
            key: OwnerKey(key),
            alive: AtomicBool::new(true),
            position: Mutex::new(position),
        })
    }

    fn position(&self) -> Vec3 {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_position(&self, position: Vec3) {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = position;
    }

    fn retire(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Owner for Body {
    fn owner_key(&self) -> OwnerKey {
        self.key
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct FollowLink {
    parent: Arc<Body>,
    child: Arc<Body>,
    offset: Vec3,
}

/// Two chained passes per cycle: load parent positions, then place children.
struct FollowKernel {
    parents: SharedLane<Arc<Body>>,
    children: SharedLane<Arc<Body>>,
    offsets: SharedLane<Vec3>,
    targets: SharedLane<Vec3>,
}

impl BatchKernel for FollowKernel {
    type Data = FollowLink;

    fn name(&self) -> &str {
        "follow"
    }

    fn add_element(&mut self, link: FollowLink) {
        self.parents.push(link.parent);
        self.children.push(link.child);
        self.offsets.push(link.offset);
        self.targets.push([0.0; 3]);
    }

    fn remove_element_swap_back(&mut self, index: usize) {
        self.parents.swap_remove(index);
        self.children.swap_remove(index);
        self.offsets.swap_remove(index);
        self.targets.swap_remove(index);
    }

    fn update_element(&mut self, index: usize, link: FollowLink) {
        self.parents.set(index, link.parent);
        self.children.set(index, link.child);
        self.offsets.set(index, link.offset);
    }

    fn read_element(&self, index: usize) -> Option<FollowLink> {
        Some(FollowLink {
            parent: self.parents.get(index)?,
            child: self.children.get(index)?,
            offset: self.offsets.get(index)?,
        })
    }

    fn schedule_work(
        &mut self,
        pool: &WorkerPool,
        depends_on: &DependencyHandle,
    ) -> Result<DependencyHandle, JobError> {
        let (parents, offsets, targets) =
            (self.parents.clone(), self.offsets.clone(), self.targets.clone());
        let loaded = pool.schedule(depends_on, move || {
            let parents = parents.read();
            let offsets = offsets.read();
            targets
                .write()
                .par_iter_mut()
                .zip(parents.par_iter().zip(offsets.par_iter()))
                .for_each(|(target, (parent, offset))| {
                    let p = parent.position();
                    *target = [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]];
                });
        });

        let (children, targets) = (self.children.clone(), self.targets.clone());
        Ok(pool.schedule(&loaded, move || {
            let targets = targets.read();
            children
                .read()
                .par_iter()
                .zip(targets.par_iter())
                .filter(|(child, _)| child.is_alive())
                .for_each(|(child, target)| child.set_position(*target));
        }))
    }

    fn release(&mut self) {
        self.parents.clear_and_release();
        self.children.clear_and_release();
        self.offsets.clear_and_release();
        self.targets.clear_and_release();
    }
}

impl RegisteredJob for FollowKernel {
    fn create(config: &EngineConfig) -> Self {
        let capacity = config.initial_capacity;
        Self {
            parents: SharedLane::with_capacity(capacity),
            children: SharedLane::with_capacity(capacity),
            offsets: SharedLane::with_capacity(capacity),
            targets: SharedLane::with_capacity(capacity),
        }
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::from_env().context("invalid engine config in environment")?,
    };
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    config.validate()?;
    Ok(config)
}

/// Print the update invoker's metrics as JSON. False when the phase never
/// got a job.
fn print_metrics(registry: &JobRegistry) -> Result<bool> {
    let Some(invoker) = registry.invoker(Phase::Update) else {
        return Ok(false);
    };
    let metrics = invoker
        .lock()
        .map_err(|_| anyhow!("invoker lock poisoned"))?
        .metrics()
        .clone();
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(true)
}

fn main() -> Result<()> {
    jobit_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let registry = JobRegistry::new(config);
    registry.init();

    let mut links: Vec<FollowLink> = (0..args.owners)
        .map(|i| {
            let x = i as f32;
            FollowLink {
                parent: Body::new(2 * i as u64, [x, 0.0, 0.0]),
                child: Body::new(2 * i as u64 + 1, [0.0; 3]),
                offset: [0.0, 1.0, 0.5],
            }
        })
        .collect();
    for link in &links {
        registry.register::<FollowKernel, _>(&link.child, link.clone());
    }
    info!(owners = links.len(), ticks = args.ticks, "simulation started");

    for tick in 0..args.ticks {
        let t = tick as f32 * 0.1;
        for (i, link) in links.iter().enumerate() {
            link.parent.set_position([i as f32 + t.cos(), t.sin(), 0.0]);
        }

        if registry.run_phase(Phase::Update).is_none() {
            warn!(tick, "nothing dispatched");
        }
        registry.resolve_phase(Phase::Update);

        if args.retire_every > 0 && tick > 0 && tick % args.retire_every == 0 {
            // Retired children are dropped silently on the next drain.
            if let Some(retired) = links.pop() {
                retired.child.retire();
            }
            if let Some(withdrawn) = links.pop() {
                registry.withdraw::<FollowKernel, _>(&withdrawn.child);
            }
        }
    }

    if let Some(link) = links.first() {
        if let Some(current) = registry.try_read_job_data::<FollowKernel, _>(link.child.as_ref()) {
            info!(
                child = %link.child.owner_key(),
                parent = ?current.parent.position(),
                position = ?current.child.position(),
                "sample link"
            );
        }
    }

    if !print_metrics(&registry)? {
        info!("no jobs were created, skipping metrics");
    }

    let diagnostics = registry.take_diagnostics();
    if !diagnostics.is_empty() {
        warn!(count = diagnostics.len(), "diagnostics recorded during the run");
    }

    registry.teardown();
    info!("simulation finished");
    Ok(())
}
