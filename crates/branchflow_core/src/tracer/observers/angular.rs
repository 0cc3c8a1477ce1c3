//! Angle histograms of the ray direction at fixed times.

use std::any::Any;
use std::f64::consts::{PI, TAU};
use std::io::Write;

use crate::error::{Error, Result};
use crate::io;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::{State, Vect};

/// Thread-local observer binning the planar velocity angle `atan2(v_y, v_x)`
/// at each of a list of observation times, with the velocity interpolated
/// onto the exact time between two integrator samples.
pub struct AngularHistogramObserver {
    file_name: String,
    bin_size: f64,
    bin_count: usize,
    times: Vec<f64>,

    counts: Vec<Vec<u64>>,
    sum_angle: Vec<f64>,
    sum_squared: Vec<f64>,

    // per-trajectory state
    next_time: usize,
    old_velocity: Vect,
    old_time: f64,
}

impl AngularHistogramObserver {
    pub fn new(times: Vec<f64>, bin_size: f64, file_name: String) -> Result<Self> {
        if bin_size <= 0.0 || bin_size > TAU {
            return Err(Error::domain(format!(
                "angular bin size {bin_size} outside (0, 2π]"
            )));
        }
        let bin_count = (TAU / bin_size) as usize;
        Ok(AngularHistogramObserver {
            file_name,
            bin_size,
            bin_count,
            counts: vec![vec![0; bin_count]; times.len()],
            sum_angle: vec![0.0; times.len()],
            sum_squared: vec![0.0; times.len()],
            times,
            next_time: 0,
            old_velocity: Vect::zeros(2),
            old_time: 0.0,
        })
    }

    fn record(&mut self, slot: usize, velocity: &Vect) {
        let angle = velocity[1].atan2(velocity[0]);
        self.sum_angle[slot] += angle;
        self.sum_squared[slot] += angle * angle;

        // shift into [0, 2π); clamp the rounding edge at exactly 2π
        let mut bin = ((angle + PI) / self.bin_size) as usize;
        if bin == self.bin_count {
            bin = self.bin_count - 1;
        }
        self.counts[slot][bin] += 1;
    }
}

impl Observer for AngularHistogramObserver {
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
            // interpolate the velocity onto the observation time; important
            // when several observation times fall into one adaptive step
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
        out.write_all(b"angh001\n")?;
        io::write_u64(out, self.times.len() as u64)?;
        io::write_u64(out, self.bin_count as u64)?;
        io::write_f64s(out, &self.times)?;
        for j in 0..self.bin_count {
            io::write_f64(out, j as f64 * self.bin_size - PI)?;
        }
        io::write_f64s(out, &self.sum_angle)?;
        io::write_f64s(out, &self.sum_squared)?;
        for histogram in &self.counts {
            for &count in histogram {
                io::write_u64(out, count)?;
            }
        }
        Ok(())
    }
}

impl LocalObserver for AngularHistogramObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        Box::new(
            AngularHistogramObserver::new(
                self.times.clone(),
                self.bin_size,
                self.file_name.clone(),
            )
            .expect("cloning a valid angular histogram observer"),
        )
    }

    fn combine(&mut self, other: Box<dyn Any>) {
        let other = other
            .downcast::<AngularHistogramObserver>()
            .expect("combining observers of different types");
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += b;
            }
        }
        for (a, b) in self.sum_angle.iter_mut().zip(&other.sum_angle) {
            *a += b;
        }
        for (a, b) in self.sum_squared.iter_mut().zip(&other.sum_squared) {
            *a += b;
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_velocity(v: [f64; 2]) -> State {
        let mut state = State::new(2);
        *state.velocity_mut() = Vect::from_slice(&v);
        state
    }

    fn ic_with_velocity(v: [f64; 2]) -> InitialCondition {
        InitialCondition {
            state: state_with_velocity(v),
            deltas: Vec::new(),
            manifold_index: vec![0],
            manifold_coordinates: vec![0.0],
        }
    }

    #[test]
    fn bins_the_direction_at_each_time() {
        let mut obs =
            AngularHistogramObserver::new(vec![0.5, 1.0], 0.01, "angles.dat".into()).unwrap();
        let ic = ic_with_velocity([1.0, 0.0]);

        obs.start_trajectory(&ic, 1);
        obs.watch(&state_with_velocity([1.0, 0.0]), 0.4);
        // crossing both observation times in one step
        let done = obs.watch(&state_with_velocity([1.0, 0.0]), 1.2);
        assert!(!done);

        let total_first: u64 = obs.counts[0].iter().sum();
        let total_second: u64 = obs.counts[1].iter().sum();
        assert_eq!(total_first, 1);
        assert_eq!(total_second, 1);

        // angle 0 lands in the bin at π / bin_size
        let bin = (PI / 0.01) as usize;
        assert_eq!(obs.counts[0][bin], 1);
        assert_eq!(obs.sum_angle[0], 0.0);
    }

    #[test]
    fn interpolates_velocity_onto_the_observation_time() {
        let mut obs = AngularHistogramObserver::new(vec![0.5], 0.01, "angles.dat".into()).unwrap();
        let ic = ic_with_velocity([1.0, 0.0]);

        obs.start_trajectory(&ic, 1);
        obs.watch(&state_with_velocity([1.0, 0.0]), 0.0);
        obs.watch(&state_with_velocity([1.0, 1.0]), 1.0);

        // at t = 0.5 the interpolated velocity is (1.0, 0.5)
        let expected = 0.5f64.atan2(1.0);
        assert!((obs.sum_angle[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn combine_sums_counts_and_moments() {
        let mut root = AngularHistogramObserver::new(vec![0.5], 0.1, "a.dat".into()).unwrap();
        let mut clone = AngularHistogramObserver::new(vec![0.5], 0.1, "a.dat".into()).unwrap();

        let ic = ic_with_velocity([0.0, 1.0]);
        clone.start_trajectory(&ic, 1);
        clone.watch(&state_with_velocity([0.0, 1.0]), 1.0);

        root.combine(Box::new(clone));
        let total: u64 = root.counts[0].iter().sum();
        assert_eq!(total, 1);
        assert!((root.sum_angle[0] - PI / 2.0).abs() < 1e-12);
    }
}
