//! Ray-density accumulation over a pool of worker grids.

use std::any::Any;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use log::debug;

use crate::error::{Error, Result};
use crate::grid::{Grid, IndexMode};
use crate::interp;
use crate::io;
use crate::memory::MemoryBudget;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::{State, Vect};

/// Weight extracted from a state for each deposited sample; the plain ray
/// density uses the constant one, flux densities use a velocity component.
pub type ExtractFn = Arc<dyn Fn(&State) -> f64 + Send + Sync>;

/// One interpolated deposition point in grid coordinates.
#[derive(Debug, Clone, Copy)]
pub struct IpDot {
    pub position: Vect,
    pub weight: f64,
}

const INITIAL_TRAJECTORY_RESERVE: usize = 1020;
const QUEUE_GROWTH: usize = 500;
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(100);

/// Pool of density grids fed by a lock-free queue of finished trajectories.
///
/// Producers (integration workers finishing a trajectory) push dot lists and
/// opportunistically drain the queue into any grid whose mutex they can
/// grab. When the queue backs up, the pool allocates another grid as long as
/// the memory budget permits, and otherwise back-pressures the producer.
pub struct DensityWorkerPool {
    extents: Vec<usize>,
    queue: SegQueue<Vec<IpDot>>,
    queue_len: AtomicUsize,
    max_queue: AtomicUsize,
    reuse: SegQueue<Vec<IpDot>>,
    grids: Mutex<Vec<Arc<Mutex<Grid<f32>>>>>,
    free_grids: AtomicIsize,
    can_grow: AtomicBool,
    budget: Arc<MemoryBudget>,
}

impl DensityWorkerPool {
    pub fn new(extents: &[usize], budget: Arc<MemoryBudget>) -> Result<Self> {
        let first = Grid::try_new(extents, IndexMode::Periodic)?;
        let bytes = first.len() * std::mem::size_of::<f32>();
        // the first grid is mandatory; an exhausted budget only disables growth
        let can_grow = budget.try_allocate(bytes);

        Ok(DensityWorkerPool {
            extents: extents.to_vec(),
            queue: SegQueue::new(),
            queue_len: AtomicUsize::new(0),
            max_queue: AtomicUsize::new(QUEUE_GROWTH),
            reuse: SegQueue::new(),
            grids: Mutex::new(vec![Arc::new(Mutex::new(first))]),
            free_grids: AtomicIsize::new(1),
            can_grow: AtomicBool::new(can_grow),
            budget,
        })
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    /// Hands a trajectory's dots to the pool. `cache` comes back empty and
    /// ready for reuse.
    pub fn push_trajectory(&self, cache: &mut Vec<IpDot>) {
        let mut container = self.reuse.pop().unwrap_or_else(|| {
            let mut v = Vec::new();
            v.reserve(INITIAL_TRAJECTORY_RESERVE);
            v
        });
        container.clear();
        std::mem::swap(&mut container, cache);

        self.queue.push(container);
        let len = self.queue_len.fetch_add(1, Ordering::SeqCst) + 1;

        if len > self.max_queue.load(Ordering::SeqCst) {
            if !self.try_grow() {
                // budget exhausted: drain what we can and wait for the
                // consumers to catch up
                while self.queue_len.load(Ordering::SeqCst)
                    >= self.max_queue.load(Ordering::SeqCst)
                {
                    self.work();
                    if self.queue_len.load(Ordering::SeqCst)
                        >= self.max_queue.load(Ordering::SeqCst)
                    {
                        std::thread::sleep(BACKPRESSURE_SLEEP);
                    }
                }
            }
        }
    }

    fn try_grow(&self) -> bool {
        if !self.can_grow.load(Ordering::SeqCst) {
            return false;
        }
        let bytes = self.extents.iter().product::<usize>() * std::mem::size_of::<f32>();
        if !self.budget.try_allocate(bytes) {
            self.can_grow.store(false, Ordering::SeqCst);
            return false;
        }

        match Grid::try_new(&self.extents, IndexMode::Periodic) {
            Ok(grid) => {
                let mut grids = self.grids.lock().expect("density grid list poisoned");
                grids.push(Arc::new(Mutex::new(grid)));
                self.free_grids.fetch_add(1, Ordering::SeqCst);
                self.max_queue.fetch_add(QUEUE_GROWTH, Ordering::SeqCst);
                debug!(
                    "added density grid ({} total), queue {} / {}",
                    grids.len(),
                    self.queue_len.load(Ordering::SeqCst),
                    self.max_queue.load(Ordering::SeqCst)
                );
                true
            }
            Err(_) => {
                self.budget.release(bytes);
                self.can_grow.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Drains the queue into the first grid whose mutex is free. Returns
    /// immediately when every grid is busy.
    pub fn work(&self) {
        if self.free_grids.load(Ordering::SeqCst) <= 0 {
            return;
        }

        let handles: Vec<Arc<Mutex<Grid<f32>>>> = self
            .grids
            .lock()
            .expect("density grid list poisoned")
            .clone();

        for handle in handles {
            let Ok(mut grid) = handle.try_lock() else {
                continue;
            };
            self.free_grids.fetch_sub(1, Ordering::SeqCst);

            while let Some(mut trajectory) = self.queue.pop() {
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
                for dot in &trajectory {
                    interp::splat(&mut grid, dot.position.as_slice(), dot.weight);
                }
                trajectory.clear();
                self.reuse.push(trajectory);
            }

            self.free_grids.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    /// Drains any remaining work and folds all grids into the first one.
    /// Only well-defined because the reduction sum is commutative.
    pub fn reduce(&self) {
        self.work();

        let mut grids = self.grids.lock().expect("density grid list poisoned");
        let (first, rest) = grids.split_first().expect("density pool has no grids");
        let mut main = first.lock().expect("density grid poisoned");
        for other in rest {
            let other = other.lock().expect("density grid poisoned");
            for (target, value) in main.data_mut().iter_mut().zip(other.as_slice()) {
                *target += value;
            }
        }
        drop(main);

        let released = grids.len().saturating_sub(1);
        grids.truncate(1);
        self.free_grids.store(1, Ordering::SeqCst);
        let bytes = self.extents.iter().product::<usize>() * std::mem::size_of::<f32>();
        for _ in 0..released {
            self.budget.release(bytes);
        }
    }

    /// The accumulated density. Call after [`DensityWorkerPool::reduce`].
    pub fn density(&self) -> Arc<Mutex<Grid<f32>>> {
        let grids = self.grids.lock().expect("density grid list poisoned");
        debug_assert_eq!(grids.len(), 1, "density grids not reduced yet");
        Arc::clone(&grids[0])
    }
}

/// Thread-local observer depositing `weight · ∫ f(state) dt` onto a grid.
///
/// Each step's path segment is subdivided at roughly three samples per
/// crossed cell; the dots of a trajectory are buffered locally and handed to
/// the shared [`DensityWorkerPool`] when the trajectory ends.
pub struct DensityObserver {
    dimension: usize,
    file_name: String,
    size: Vec<usize>,
    support: Vec<f64>,
    scaling: Vect,
    cell_density: f64,
    center_on_start: bool,
    extract: ExtractFn,
    worker: Arc<DensityWorkerPool>,

    dots: Vec<IpDot>,
    starting_position: Vect,
    last_position: Vect,
    last_time: f64,
}

impl DensityObserver {
    pub fn new(
        size: Vec<usize>,
        support: Vec<f64>,
        file_name: String,
        center_on_start: bool,
        extract: ExtractFn,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        let dimension = size.len();
        if support.len() != dimension {
            return Err(Error::shape(format!(
                "density support has {} components for a {dimension}-dimensional grid",
                support.len()
            )));
        }

        let worker = Arc::new(DensityWorkerPool::new(&size, budget)?);
        Self::with_worker(size, support, file_name, center_on_start, extract, worker)
    }

    fn with_worker(
        size: Vec<usize>,
        support: Vec<f64>,
        file_name: String,
        center_on_start: bool,
        extract: ExtractFn,
        worker: Arc<DensityWorkerPool>,
    ) -> Result<Self> {
        let dimension = size.len();
        let mut scaling = Vect::zeros(dimension);
        let mut cell_density = 1.0;
        for i in 0..dimension {
            scaling[i] = size[i] as f64 / support[i];
            cell_density *= scaling[i];
        }

        Ok(DensityObserver {
            dimension,
            file_name,
            size,
            support,
            scaling,
            cell_density,
            center_on_start,
            extract,
            worker,
            dots: Vec::new(),
            starting_position: Vect::zeros(dimension),
            last_position: Vect::zeros(dimension),
            last_time: f64::INFINITY,
        })
    }

    fn add_interpolated_line(&mut self, start: &Vect, end: &Vect, weight: f64) {
        let length = end.sub(start).norm();
        // three sub-samples per crossed cell
        let samples = ((length * 3.0) as usize).max(1);
        // weight per cell volume, so the result is independent of resolution
        let dot_weight = weight / samples as f64 * self.cell_density;

        for sample in 0..samples {
            let fraction = (sample as f64 + 0.5) / samples as f64;
            self.dots.push(IpDot {
                position: Vect::lerp(start, end, fraction),
                weight: dot_weight,
            });
        }
    }
}

impl Observer for DensityObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, _trajectory: u64) {
        self.dots.clear();
        self.starting_position = *ic.state.position();
        self.last_time = f64::INFINITY;
    }

    fn watch(&mut self, state: &State, time: f64) -> bool {
        let mut new_position = *state.position();
        if self.center_on_start {
            new_position = new_position.sub(&self.starting_position);
        }

        let mut previous = Vect::zeros(self.dimension);
        let mut current = Vect::zeros(self.dimension);
        for i in 0..self.dimension {
            previous[i] = self.last_position[i] * self.scaling[i];
            current[i] = new_position[i] * self.scaling[i];
            if self.center_on_start {
                let shift = self.support[i] / 2.0 * self.scaling[i];
                previous[i] += shift;
                current[i] += shift;
            }
            // leaving the recorded support ends this observer's interest
            if current[i] < 0.0 || current[i] >= self.size[i] as f64 {
                return false;
            }
        }

        let weight = (self.extract)(state);
        if time > self.last_time {
            self.add_interpolated_line(&previous, &current, (time - self.last_time) * weight);
        }

        self.last_time = time;
        self.last_position = new_position;
        true
    }

    fn end_trajectory(&mut self, _final_state: &State) {
        self.worker.push_trajectory(&mut self.dots);
        debug_assert!(self.dots.is_empty());
        self.worker.work();
    }

    fn end_tracing(&mut self, particle_count: u64) {
        self.worker.reduce();
        if particle_count > 0 {
            let density = self.worker.density();
            let mut grid = density.lock().expect("density grid poisoned");
            let scale = 1.0 / particle_count as f32;
            for cell in grid.data_mut() {
                *cell *= scale;
            }
        }
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"dens001\n")?;
        io::write_u64(out, self.dimension as u64)?;
        io::write_f64s(out, &self.support)?;
        let density = self.worker.density();
        let grid = density.lock().expect("density grid poisoned");
        grid.dump(out)?;
        Ok(())
    }
}

impl LocalObserver for DensityObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        Box::new(
            DensityObserver::with_worker(
                self.size.clone(),
                self.support.clone(),
                self.file_name.clone(),
                self.center_on_start,
                Arc::clone(&self.extract),
                Arc::clone(&self.worker),
            )
            .expect("cloning a valid density observer"),
        )
    }

    /// All clones write through the shared worker pool, so there is no
    /// per-clone data left to merge.
    fn combine(&mut self, _other: Box<dyn Any>) {}

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::state::RayState;

    fn unit_extract() -> ExtractFn {
        Arc::new(|_state: &State| 1.0)
    }

    fn observer(size: usize) -> DensityObserver {
        DensityObserver::new(
            vec![size, size],
            vec![1.0, 1.0],
            "density.dat".into(),
            false,
            unit_extract(),
            Arc::new(MemoryBudget::unlimited()),
        )
        .unwrap()
    }

    fn state_at(x: f64, y: f64) -> State {
        let mut ray = RayState::new(2, false);
        ray.position_mut().copy_from_slice(&[x, y]);
        ray.velocity_mut().copy_from_slice(&[1.0, 0.0]);
        State::from_ray(&ray)
    }

    fn ic_at(x: f64, y: f64) -> InitialCondition {
        InitialCondition {
            state: state_at(x, y),
            deltas: Vec::new(),
            manifold_index: vec![0],
            manifold_coordinates: vec![0.5],
        }
    }

    #[test]
    fn deposited_mass_matches_time_integral() {
        // a straight trajectory of duration 1 deposits weight·Δt·cells
        let mut obs = observer(16);
        let ic = ic_at(0.1, 0.5);

        obs.start_trajectory(&ic, 1);
        let steps = 20;
        for step in 0..=steps {
            let t = step as f64 / steps as f64;
            let state = state_at(0.1 + 0.7 * t, 0.5);
            assert!(obs.watch(&state, t));
        }
        obs.end_trajectory(&state_at(0.8, 0.5));
        obs.end_tracing(1);

        let density = obs.worker.density();
        let grid = density.lock().unwrap();
        let total: f64 = grid.as_slice().iter().map(|&v| v as f64).sum();
        // ∫ dt · cell_density = 1 · 256
        assert!((total - 256.0).abs() < 1e-3, "total {total}");
    }

    #[test]
    fn leaving_the_support_stops_the_observer() {
        let mut obs = observer(8);
        let ic = ic_at(0.9, 0.5);
        obs.start_trajectory(&ic, 1);
        assert!(obs.watch(&state_at(0.9, 0.5), 0.0));
        assert!(!obs.watch(&state_at(1.1, 0.5), 0.1));
    }

    #[test]
    fn pool_reduces_multiple_grids_to_one_sum() {
        let budget = Arc::new(MemoryBudget::unlimited());
        let pool = DensityWorkerPool::new(&[4, 4], budget).unwrap();

        let mut dots = vec![
            IpDot {
                position: Vect::from_slice(&[1.0, 1.0]),
                weight: 2.0,
            },
            IpDot {
                position: Vect::from_slice(&[2.0, 2.0]),
                weight: 3.0,
            },
        ];
        pool.push_trajectory(&mut dots);
        assert!(dots.is_empty());
        pool.work();
        pool.reduce();

        let density = pool.density();
        let grid = density.lock().unwrap();
        let total: f64 = grid.as_slice().iter().map(|&v| v as f64).sum();
        assert!((total - 5.0).abs() < 1e-5);
    }

    #[test]
    fn budget_limits_grid_growth() {
        // room for exactly one grid, so growth is disabled immediately
        let bytes = 4 * 4 * std::mem::size_of::<f32>();
        let budget = Arc::new(MemoryBudget::new(bytes));
        let pool = DensityWorkerPool::new(&[4, 4], budget).unwrap();
        assert!(!pool.try_grow());
        assert_eq!(pool.grids.lock().unwrap().len(), 1);
    }
}
