//! The ray-tracing driver.
//!
//! Splits the initial-condition stream across worker threads; each worker
//! owns a clone of every thread-local observer and integrates trajectories
//! until the stream is exhausted.

pub mod dynamics;
pub mod ic;
pub mod integrate;
pub mod observers;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::potential::Potential;

use dynamics::RayDynamics;
use ic::{InitialConditionConfig, InitialConditionGenerator};
use integrate::{integrate_adaptive, integrate_euler, CashKarp54};
use observers::{EnergyErrorObserver, LocalObserver, MasterObserver, SharedObserver};
use state::RayState;

/// Which stepping scheme to use per trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorKind {
    /// Runge–Kutta–Cash–Karp 5(4) with error control.
    Adaptive,
    /// Fixed-step explicit Euler.
    Euler,
}

/// Aggregate outcome of a tracing run.
#[derive(Debug, Clone, Copy)]
pub struct TraceResult {
    pub max_relative_energy_error: f64,
    pub mean_relative_energy_error: f64,
    pub particle_count: u64,
}

pub struct Tracer {
    dimension: usize,
    support: Vec<f64>,
    extents: Vec<usize>,
    dynamics: Arc<dyn RayDynamics>,
    master: MasterObserver,
    energy_observer: Arc<Mutex<EnergyErrorObserver>>,
    initial_dt: f64,
    end_time: f64,
    max_threads: usize,
    abs_error: f64,
    rel_error: f64,
    integrator: IntegratorKind,
}

impl Tracer {
    /// Creates a tracer for a potential. The initial step is one grid cell
    /// in the fastest direction; an energy-error observer is always present.
    pub fn new(potential: &Potential, dynamics: Arc<dyn RayDynamics>) -> Self {
        let dimension = potential.dimension();
        let initial_dt = potential
            .support()
            .iter()
            .zip(potential.extents())
            .map(|(s, &e)| s / e as f64)
            .fold(f64::INFINITY, f64::min);

        let energy_observer = Arc::new(Mutex::new(EnergyErrorObserver::new(
            "energy_errors.json".to_owned(),
        )));
        let mut master = MasterObserver::new(dimension);
        master.add_local(Arc::clone(&energy_observer) as Arc<Mutex<dyn LocalObserver>>);

        Tracer {
            dimension,
            support: potential.support().to_vec(),
            extents: potential.extents().to_vec(),
            dynamics,
            master,
            energy_observer,
            initial_dt,
            end_time: 1.0,
            max_threads: usize::MAX,
            abs_error: 1e-6,
            rel_error: 1e-6,
            integrator: IntegratorKind::Adaptive,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn add_local_observer(&mut self, observer: Arc<Mutex<dyn LocalObserver>>) {
        self.master.add_local(observer);
    }

    pub fn add_shared_observer(&mut self, observer: Arc<Mutex<dyn SharedObserver>>) {
        self.master.add_shared(observer);
    }

    pub fn master(&self) -> &MasterObserver {
        &self.master
    }

    pub fn set_error_bounds(&mut self, abs_error: f64, rel_error: f64) {
        self.abs_error = abs_error;
        self.rel_error = rel_error;
    }

    pub fn set_end_time(&mut self, end_time: f64) {
        self.end_time = end_time;
    }

    pub fn set_max_threads(&mut self, threads: usize) {
        self.max_threads = threads.max(1);
    }

    pub fn set_integrator(&mut self, integrator: IntegratorKind) {
        self.integrator = integrator;
    }

    /// Overrides the step used for observation spacing (and for Euler, the
    /// integration step itself).
    pub fn set_time_step(&mut self, dt: f64) {
        self.initial_dt = dt;
    }

    pub fn traced_particle_count(&self) -> u64 {
        self.master.traced_particle_count()
    }

    /// Runs the full ensemble and reduces all observers.
    pub fn trace(
        &self,
        generator: &InitialConditionGenerator,
        mut config: InitialConditionConfig,
    ) -> Result<TraceResult> {
        // keep a one-cell safety margin at the boundary so interpolation
        // on non-periodic runs never wraps
        let mut support = self.support.clone();
        let mut offset = vec![0.0; self.dimension];
        for i in 0..self.dimension {
            offset[i] = self.support[i] / self.extents[i] as f64;
            support[i] -= 2.0 * offset[i];
        }
        config.support = support;
        config.offset = offset;
        config.dynamics = Some(Arc::clone(&self.dynamics));
        generator.init(config)?;

        self.master.start_tracing(&self.dynamics)?;

        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let threads = self.max_threads.min(hardware).max(1);
        info!("distributing ray tracing to {threads} threads");

        let worker_results: Vec<std::thread::Result<Result<()>>> =
            std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(threads);
                for worker in 0..threads {
                    let generator = &*generator;
                    handles.push(
                        scope.spawn(move || self.trace_worker(generator, worker == 0)),
                    );
                }
                handles.into_iter().map(|handle| handle.join()).collect()
            });

        for result in worker_results {
            result.map_err(|_| Error::programming("tracing worker panicked"))??;
        }

        self.master.finish_tracing();

        let energy = self.energy_observer.lock().expect("observer mutex poisoned");
        Ok(TraceResult {
            max_relative_energy_error: energy.maximum_error(),
            mean_relative_energy_error: energy.mean_error(),
            particle_count: self.master.traced_particle_count(),
        })
    }

    fn trace_worker(&self, generator: &InitialConditionGenerator, printer: bool) -> Result<()> {
        let mut observer = self.master.worker(&self.dynamics);
        let monodromy = self.dynamics.has_monodromy();
        let mut ray = RayState::new(self.dimension, monodromy);
        let mut stepper = CashKarp54::new(ray.as_slice().len(), self.abs_error, self.rel_error);

        let dynamics = &*self.dynamics;
        let system = move |t: f64, x: &[f64], dxdt: &mut [f64]| dynamics.state_update(x, dxdt, t);

        let mut last_report = Instant::now();
        while let Some(ic) = generator.next()? {
            if printer && last_report.elapsed() > Duration::from_secs(10) {
                last_report = Instant::now();
                info!(
                    "integrated {} trajectories",
                    self.master.traced_particle_count()
                );
            }

            ray.position_mut().copy_from_slice(ic.state.position().as_slice());
            ray.velocity_mut().copy_from_slice(ic.state.velocity().as_slice());
            if monodromy {
                ray.init_monodromy();
            }

            observer.start_trajectory(&ic);

            let observe = &mut |x: &[f64], t: f64| observer.observe(x, t);
            let outcome = match self.integrator {
                IntegratorKind::Adaptive => integrate_adaptive(
                    &mut stepper,
                    &system,
                    ray.as_mut_slice(),
                    self.end_time,
                    self.initial_dt,
                    observe,
                ),
                IntegratorKind::Euler => integrate_euler(
                    &system,
                    ray.as_mut_slice(),
                    self.end_time,
                    self.initial_dt,
                    observe,
                ),
            };
            if let Err(err) = outcome {
                warn!("trajectory integration failed: {err}");
            }

            observer.finish_trajectory(&ic);
        }
        Ok(())
    }
}
