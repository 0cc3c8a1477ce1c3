//! Observers reduce per-trajectory data into aggregate results.
//!
//! Two kinds exist. Thread-local observers are cloned once per worker; each
//! clone accumulates privately and is merged into its root when the worker
//! drops it. Thread-shared observers are a single mutex-guarded instance;
//! the master observer buffers a trajectory's samples and replays them under
//! the lock, so a shared observer sees whole trajectories at once.

mod angular;
mod caustic;
mod density;
mod energy;
mod master;
mod radial_density;
mod velocity_histogram;
mod velocity_transition;

pub use angular::AngularHistogramObserver;
pub use caustic::{CausticObserver, CausticRecord};
pub use density::{DensityObserver, DensityWorkerPool, ExtractFn, IpDot};
pub use energy::{EnergyErrorObserver, EnergyStats};
pub use master::{MasterObserver, WorkerObserver};
pub use radial_density::RadialDensityObserver;
pub use velocity_histogram::VelocityHistogramObserver;
pub use velocity_transition::VelocityTransitionObserver;

use std::any::Any;
use std::io::Write;
use std::sync::Arc;

use crate::error::Result;
use crate::tracer::dynamics::RayDynamics;
use crate::tracer::ic::InitialCondition;
use crate::tracer::state::State;

/// Callbacks every observer implements. Lifecycle:
/// `init` → `start_tracing` → per trajectory `start_trajectory`,
/// `watch`…, `end_trajectory` → `end_tracing` → `save`.
pub trait Observer: Send {
    /// Name of the save file this observer wants, relative to the result
    /// directory.
    fn file_name(&self) -> &str;

    /// Injects the dynamics, for observers that measure energies.
    fn init(&mut self, _dynamics: &Arc<dyn RayDynamics>) {}

    /// Called once before the first worker runs.
    fn start_tracing(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, trajectory: u64);

    /// Called after every integration step. Returning `false` means this
    /// observer wants no further samples of the current trajectory.
    fn watch(&mut self, state: &State, t: f64) -> bool;

    fn end_trajectory(&mut self, _final_state: &State) {}

    fn end_tracing(&mut self, _particle_count: u64) {}

    fn save(&mut self, out: &mut dyn Write) -> Result<()>;
}

/// Observer with per-worker clones reduced into a root.
///
/// `combine` must be a commutative-associative fold; the order in which
/// workers merge is not defined.
pub trait LocalObserver: Observer {
    /// A fresh instance with the same configuration and empty data.
    fn clone_for_thread(&self) -> Box<dyn LocalObserver>;

    /// Folds a clone's data into `self`. `other` is always the same concrete
    /// type as `self`.
    fn combine(&mut self, other: Box<dyn Any>);

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Observer shared by all workers behind a mutex. Sees `watch` calls of one
/// trajectory in order, but trajectories only interleave at trajectory
/// boundaries.
pub trait SharedObserver: Observer {}
