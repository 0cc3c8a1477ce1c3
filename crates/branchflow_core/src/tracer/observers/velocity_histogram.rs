//! Histograms of the transverse velocity components at fixed times.

use std::any::Any;
use std::io::Write;

use crate::error::{Error, Result};
use crate::grid::{Grid, IndexMode};
use crate::io;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::{State, Vect};

const VELOCITY_RANGE: f64 = 1.5;

fn to_bin(value: f64, bins: usize) -> i64 {
    let normalised = (value.clamp(-1.0, 1.0) + 1.0) / 2.0;
    (normalised * (bins - 1) as f64).round() as i64
}

/// Thread-local observer that bins the velocity components transverse to the
/// mean flow (all but the first) at each of a list of observation times. The
/// velocity is interpolated onto the exact time, so closely spaced
/// observation times survive large adaptive steps.
pub struct VelocityHistogramObserver {
    file_name: String,
    dimension: usize,
    bin_count: usize,
    times: Vec<f64>,
    /// One `(D-1)`-dimensional histogram per observation time.
    histograms: Vec<Grid<u64>>,

    // per-trajectory state
    next_time: usize,
    old_velocity: Vect,
    old_time: f64,
}

impl VelocityHistogramObserver {
    pub fn new(
        dimension: usize,
        times: Vec<f64>,
        bin_count: usize,
        file_name: String,
    ) -> Result<Self> {
        if !(2..=3).contains(&dimension) {
            return Err(Error::shape(format!(
                "velocity histograms require dimension 2 or 3, got {dimension}"
            )));
        }
        if bin_count < 2 {
            return Err(Error::domain(
                "velocity histograms need at least two bins",
            ));
        }

        let extents = vec![bin_count; dimension - 1];
        let mut histograms = Vec::with_capacity(times.len());
        for _ in &times {
            histograms.push(Grid::try_new(&extents, IndexMode::Identity)?);
        }

        Ok(VelocityHistogramObserver {
            file_name,
            dimension,
            bin_count,
            times,
            histograms,
            next_time: 0,
            old_velocity: Vect::zeros(dimension),
            old_time: 0.0,
        })
    }

    fn record(&mut self, slot: usize, velocity: &Vect) {
        let mut index = [0i64; 2];
        for axis in 1..self.dimension {
            index[axis - 1] = to_bin(velocity[axis] / VELOCITY_RANGE, self.bin_count);
        }
        let offset = self.histograms[slot].offset(&index[..self.dimension - 1]);
        self.histograms[slot].data_mut()[offset] += 1;
    }
}

impl Observer for VelocityHistogramObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, _trajectory: u64) {
        self.next_time = 0;
        self.old_time = 0.0;
        self.old_velocity = *ic.state.velocity();
    }

    fn watch(&mut self, state: &State, t: f64) -> bool {
        if self.next_time >= self.times.len() {
            return false;
        }

        while t > self.times[self.next_time] {
            // interpolate the velocity onto the observation time
            let fraction = (self.times[self.next_time] - self.old_time) / (t - self.old_time);
            let velocity = Vect::lerp(&self.old_velocity, state.velocity(), fraction);
            let slot = self.next_time;
            self.record(slot, &velocity);

            self.next_time += 1;
            if self.next_time >= self.times.len() {
                return false;
            }
        }

        self.old_velocity = *state.velocity();
        self.old_time = t;
        true
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"velh001\n")?;
        io::write_u64(out, self.histograms.len() as u64)?;
        io::write_u64(out, self.bin_count as u64)?;
        io::write_u64(out, self.dimension as u64)?;
        io::write_f64s(out, &self.times)?;
        for j in 0..self.bin_count {
            let bin_center = j as f64 / (self.bin_count - 1) as f64 * 2.0 - 1.0;
            io::write_f64(out, bin_center * VELOCITY_RANGE)?;
        }
        for histogram in &self.histograms {
            histogram.dump(out)?;
        }
        Ok(())
    }
}

impl LocalObserver for VelocityHistogramObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        Box::new(
            VelocityHistogramObserver::new(
                self.dimension,
                self.times.clone(),
                self.bin_count,
                self.file_name.clone(),
            )
            .expect("cloning a valid velocity histogram observer"),
        )
    }

    fn combine(&mut self, other: Box<dyn Any>) {
        let other = other
            .downcast::<VelocityHistogramObserver>()
            .expect("combining observers of different types");
        for (mine, theirs) in self.histograms.iter_mut().zip(&other.histograms) {
            for (a, &b) in mine.data_mut().iter_mut().zip(theirs.as_slice()) {
                *a += b;
            }
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_velocity(v: &[f64]) -> State {
        let mut state = State::new(v.len());
        *state.velocity_mut() = Vect::from_slice(v);
        state
    }

    fn ic_with_velocity(v: &[f64]) -> InitialCondition {
        InitialCondition {
            state: state_with_velocity(v),
            deltas: Vec::new(),
            manifold_index: vec![0],
            manifold_coordinates: vec![0.0],
        }
    }

    #[test]
    fn transverse_component_is_binned_per_time() {
        let mut obs =
            VelocityHistogramObserver::new(2, vec![0.5, 1.0], 11, "velh.dat".into()).unwrap();
        let ic = ic_with_velocity(&[1.0, 0.0]);

        obs.start_trajectory(&ic, 1);
        obs.watch(&state_with_velocity(&[1.0, 0.0]), 0.4);
        let done = obs.watch(&state_with_velocity(&[1.0, 0.0]), 1.2);
        assert!(!done);

        // v_y = 0 is the centre bin of eleven
        for histogram in &obs.histograms {
            assert_eq!(histogram.at(&[5]), 1);
            let total: u64 = histogram.as_slice().iter().sum();
            assert_eq!(total, 1);
        }
    }

    #[test]
    fn velocity_is_interpolated_onto_the_time() {
        let mut obs = VelocityHistogramObserver::new(2, vec![0.5], 11, "velh.dat".into()).unwrap();
        let ic = ic_with_velocity(&[1.0, -1.5]);

        obs.start_trajectory(&ic, 1);
        obs.watch(&state_with_velocity(&[1.0, -1.5]), 0.0);
        obs.watch(&state_with_velocity(&[1.0, 1.5]), 1.0);

        // at t = 0.5 the transverse velocity is 0, the centre bin
        assert_eq!(obs.histograms[0].at(&[5]), 1);
    }

    #[test]
    fn three_dimensional_histograms_are_square() {
        let mut obs =
            VelocityHistogramObserver::new(3, vec![0.5], 5, "velh.dat".into()).unwrap();
        assert_eq!(obs.histograms[0].extents(), &[5, 5]);

        let ic = ic_with_velocity(&[1.0, 0.0, 1.5]);
        obs.start_trajectory(&ic, 1);
        obs.watch(&state_with_velocity(&[1.0, 0.0, 1.5]), 0.3);
        obs.watch(&state_with_velocity(&[1.0, 0.0, 1.5]), 0.7);

        // v_y centre bin, v_z clamped to the top bin
        assert_eq!(obs.histograms[0].at(&[2, 4]), 1);
    }

    #[test]
    fn combine_sums_histograms() {
        let mut root = VelocityHistogramObserver::new(2, vec![0.5], 5, "velh.dat".into()).unwrap();
        let mut clone = VelocityHistogramObserver::new(2, vec![0.5], 5, "velh.dat".into()).unwrap();

        let ic = ic_with_velocity(&[1.0, 0.0]);
        clone.start_trajectory(&ic, 1);
        clone.watch(&state_with_velocity(&[1.0, 0.0]), 1.0);

        root.combine(Box::new(clone));
        let total: u64 = root.histograms[0].as_slice().iter().sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn save_format_header_and_dimension_check() {
        let mut obs = VelocityHistogramObserver::new(2, vec![0.5], 5, "velh.dat".into()).unwrap();
        let mut buf = Vec::new();
        obs.save(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"velh001\n");

        assert!(VelocityHistogramObserver::new(1, vec![0.5], 5, "velh.dat".into()).is_err());
    }
}
