//! Composition and per-worker fan-out of observers.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::error::Result;
use crate::tracer::dynamics::RayDynamics;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, SharedObserver};
use crate::tracer::state::State;

/// Owns the observer roots and the run-wide counters. Workers get a
/// [`WorkerObserver`] each; the master performs initialisation, the final
/// callbacks and saving.
pub struct MasterObserver {
    dimension: usize,
    locals: Vec<Arc<Mutex<dyn LocalObserver>>>,
    shared: Vec<Arc<Mutex<dyn SharedObserver>>>,
    particle_count: Arc<AtomicU64>,
    trajectory_counter: Arc<AtomicU64>,
}

impl MasterObserver {
    pub fn new(dimension: usize) -> Self {
        MasterObserver {
            dimension,
            locals: Vec::new(),
            shared: Vec::new(),
            particle_count: Arc::new(AtomicU64::new(0)),
            trajectory_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_local(&mut self, observer: Arc<Mutex<dyn LocalObserver>>) {
        self.locals.push(observer);
    }

    pub fn add_shared(&mut self, observer: Arc<Mutex<dyn SharedObserver>>) {
        self.shared.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.locals.len() + self.shared.len()
    }

    /// Initialises every observer for a run and resets the counters.
    pub fn start_tracing(&self, dynamics: &Arc<dyn RayDynamics>) -> Result<()> {
        self.particle_count.store(0, Ordering::SeqCst);
        self.trajectory_counter.store(0, Ordering::SeqCst);

        for local in &self.locals {
            let mut observer = local.lock().expect("observer mutex poisoned");
            observer.init(dynamics);
            observer.start_tracing()?;
        }
        for shared in &self.shared {
            let mut observer = shared.lock().expect("observer mutex poisoned");
            observer.init(dynamics);
            observer.start_tracing()?;
        }
        Ok(())
    }

    /// Creates the per-worker observer set: one clone per thread-local
    /// observer, shared handles for the rest.
    pub fn worker(&self, dynamics: &Arc<dyn RayDynamics>) -> WorkerObserver {
        let mut locals = Vec::with_capacity(self.locals.len());
        for root in &self.locals {
            let mut clone = root.lock().expect("observer mutex poisoned").clone_for_thread();
            clone.init(dynamics);
            locals.push(WorkerLocal {
                observer: Some(clone),
                root: Arc::clone(root),
            });
        }

        WorkerObserver {
            active: vec![true; locals.len()],
            locals,
            shared: self.shared.clone(),
            trajectory: Vec::with_capacity(1000),
            scratch: State::new(self.dimension),
            current_id: 0,
            particle_count: Arc::clone(&self.particle_count),
            trajectory_counter: Arc::clone(&self.trajectory_counter),
        }
    }

    /// Final callbacks after all workers have merged.
    pub fn finish_tracing(&self) {
        let count = self.particle_count.load(Ordering::SeqCst);
        for local in &self.locals {
            local.lock().expect("observer mutex poisoned").end_tracing(count);
        }
        for shared in &self.shared {
            shared.lock().expect("observer mutex poisoned").end_tracing(count);
        }
    }

    pub fn traced_particle_count(&self) -> u64 {
        self.particle_count.load(Ordering::SeqCst)
    }

    /// Writes one file per observer into `directory`. A failing observer is
    /// logged and the remaining observers are still attempted.
    pub fn save_all(&self, directory: &Path) -> Result<()> {
        let save = |file_name: &str, writer: &mut dyn FnMut(&mut BufWriter<File>) -> Result<()>| {
            let path = directory.join(file_name);
            let result = File::create(&path)
                .map_err(crate::error::Error::from)
                .and_then(|file| {
                    let mut out = BufWriter::new(file);
                    writer(&mut out)
                });
            if let Err(err) = result {
                error!("could not save observer data to {}: {err}", path.display());
            }
        };

        for local in &self.locals {
            let mut observer = local.lock().expect("observer mutex poisoned");
            let name = observer.file_name().to_owned();
            save(&name, &mut |out| observer.save(out));
        }
        for shared in &self.shared {
            let mut observer = shared.lock().expect("observer mutex poisoned");
            let name = observer.file_name().to_owned();
            save(&name, &mut |out| observer.save(out));
        }
        Ok(())
    }
}

struct WorkerLocal {
    observer: Option<Box<dyn LocalObserver>>,
    root: Arc<Mutex<dyn LocalObserver>>,
}

impl Drop for WorkerLocal {
    /// Merging happens here, so a worker clone cannot be lost: dropping the
    /// worker set folds every clone into its root exactly once.
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            match self.root.lock() {
                Ok(mut root) => root.combine(observer.into_any()),
                Err(_) => warn!("observer root poisoned, dropping worker data"),
            }
        }
    }
}

/// Per-worker observer set handed into the integration loop.
pub struct WorkerObserver {
    locals: Vec<WorkerLocal>,
    active: Vec<bool>,
    shared: Vec<Arc<Mutex<dyn SharedObserver>>>,
    /// Sample cache of the running trajectory, replayed for shared
    /// observers at the end.
    trajectory: Vec<(State, f64)>,
    scratch: State,
    current_id: u64,
    particle_count: Arc<AtomicU64>,
    trajectory_counter: Arc<AtomicU64>,
}

impl WorkerObserver {
    /// Begins a trajectory: assigns the next unique id and reactivates all
    /// local observers.
    pub fn start_trajectory(&mut self, ic: &InitialCondition) {
        self.current_id = self.trajectory_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.fill(true);
        for local in &mut self.locals {
            local
                .observer
                .as_mut()
                .expect("worker observer already merged")
                .start_trajectory(ic, self.current_id);
        }
        self.trajectory.clear();
    }

    /// Feeds one integrator sample (in the flat state layout) to the local
    /// observers. Returns `false` when nobody wants further samples, which
    /// stops the trajectory.
    pub fn observe(&mut self, data: &[f64], t: f64) -> bool {
        // shared observers always see the full trajectory from the cache
        let mut still_watching = !self.shared.is_empty();

        self.scratch.read_flat(data);
        self.trajectory.push((self.scratch, t));

        for (index, local) in self.locals.iter_mut().enumerate() {
            if !self.active[index] {
                continue;
            }
            let observer = local
                .observer
                .as_mut()
                .expect("worker observer already merged");
            if observer.watch(&self.scratch, t) {
                still_watching = true;
            } else {
                self.active[index] = false;
            }
        }
        still_watching
    }

    /// Ends a trajectory: replays the cached samples for shared observers
    /// and commits the local ones. Trajectories without samples do not count.
    pub fn finish_trajectory(&mut self, ic: &InitialCondition) {
        let Some(&(final_state, _)) = self.trajectory.last() else {
            return;
        };

        for shared in &self.shared {
            let mut observer = shared.lock().expect("observer mutex poisoned");
            observer.start_trajectory(ic, self.current_id);
            for (state, t) in &self.trajectory {
                if !observer.watch(state, *t) {
                    break;
                }
            }
            observer.end_trajectory(&final_state);
        }

        for local in &mut self.locals {
            local
                .observer
                .as_mut()
                .expect("worker observer already merged")
                .end_trajectory(&final_state);
        }

        self.particle_count.fetch_add(1, Ordering::SeqCst);
    }
}
