//! Velocity-transition counting at a fixed time interval.

use std::io::Write;

use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::grid::IndexMode;
use crate::io;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{Observer, SharedObserver};
use crate::tracer::state::{State, Vect};

/// Histogram over (pre, post) velocity pairs. Components excluded by the
/// in/out masks collapse to a single bin so the grid stays small.
struct TransitionData {
    range: f64,
    increment_mode: bool,
    bin_centers: Vec<f64>,
    counts: Grid<u32>,
}

fn to_bin(value: f64, bins: usize) -> i64 {
    let normalised = (value.clamp(-1.0, 1.0) + 1.0) / 2.0;
    (normalised * (bins - 1) as f64).round() as i64
}

impl TransitionData {
    fn new(
        dimension: usize,
        bin_count: usize,
        range: f64,
        mask_in: &[bool],
        mask_out: &[bool],
        increment_mode: bool,
    ) -> Result<Self> {
        if mask_in.len() != dimension || mask_out.len() != dimension {
            return Err(Error::shape(
                "velocity transition masks must have one entry per dimension",
            ));
        }

        let extents: Vec<usize> = mask_in
            .iter()
            .chain(mask_out)
            .map(|&used| if used { bin_count } else { 1 })
            .collect();
        let counts = Grid::try_new(&extents, IndexMode::Identity)?;

        let bin_centers = (0..bin_count)
            .map(|j| (j as f64 / (bin_count - 1) as f64 * 2.0 - 1.0) * range)
            .collect();

        Ok(TransitionData {
            range,
            increment_mode,
            bin_centers,
            counts,
        })
    }

    fn record(&mut self, old_velocity: &Vect, velocity: &Vect) {
        let dimension = old_velocity.len();
        let mut index = [0i64; 6];
        for i in 0..dimension {
            index[i] = to_bin(old_velocity[i] / self.range, self.counts.extents()[i]);
        }
        for i in 0..dimension {
            let value = if self.increment_mode {
                velocity[i] - old_velocity[i]
            } else {
                velocity[i]
            };
            index[dimension + i] =
                to_bin(value / self.range, self.counts.extents()[dimension + i]);
        }

        let offset = self.counts.offset(&index[..2 * dimension]);
        self.counts.data_mut()[offset] += 1;
    }
}

/// Thread-shared observer counting how velocities change over a fixed time
/// interval. Interval boundaries are interpolated between samples so widely
/// spaced adaptive steps cannot skip transitions.
pub struct VelocityTransitionObserver {
    file_name: String,
    dimension: usize,
    bin_count: usize,
    time_interval: f64,
    start_recording: f64,
    end_recording: f64,
    data: TransitionData,

    // per-trajectory state; safe in a shared observer because trajectories
    // are replayed whole under the observer lock
    transition_start: f64,
    old_velocity: Vect,
    last_step_time: f64,
    last_step_velocity: Vect,
}

impl VelocityTransitionObserver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dimension: usize,
        time_interval: f64,
        bin_count: usize,
        start_recording: f64,
        end_recording: f64,
        mask_in: &[bool],
        mask_out: &[bool],
        increment_mode: bool,
        file_name: String,
    ) -> Result<Self> {
        if time_interval <= 0.0 {
            return Err(Error::domain(
                "velocity transition interval must be positive",
            ));
        }
        const VELOCITY_RANGE: f64 = 1.5;
        Ok(VelocityTransitionObserver {
            file_name,
            dimension,
            bin_count,
            time_interval,
            start_recording,
            end_recording,
            data: TransitionData::new(
                dimension,
                bin_count,
                VELOCITY_RANGE,
                mask_in,
                mask_out,
                increment_mode,
            )?,
            transition_start: 0.0,
            old_velocity: Vect::zeros(dimension),
            last_step_time: 0.0,
            last_step_velocity: Vect::zeros(dimension),
        })
    }
}

impl Observer for VelocityTransitionObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, _trajectory: u64) {
        self.transition_start = self.end_recording;
        self.last_step_time = 0.0;
        self.last_step_velocity = *ic.state.velocity();
    }

    fn watch(&mut self, state: &State, t: f64) -> bool {
        // recording can start at an arbitrary time; interpolate the velocity
        // at the start of the window
        if t >= self.start_recording && self.last_step_time <= self.start_recording {
            let record_step = self.start_recording - self.last_step_time;
            let time_step = t - self.last_step_time;
            // the very first step can have time_step == 0
            let fraction = if time_step < 1e-20 {
                0.0
            } else {
                record_step / time_step
            };
            self.old_velocity =
                Vect::lerp(&self.last_step_velocity, state.velocity(), fraction);
            self.transition_start = self.start_recording;
        }

        // a small epsilon on the upper bound so a boundary landing exactly
        // on the end time is not skipped
        while t >= self.transition_start + self.time_interval
            && self.transition_start + self.time_interval <= self.end_recording + 1e-10
        {
            let record_step = self.transition_start + self.time_interval - self.last_step_time;
            let time_step = t - self.last_step_time;
            let fraction = record_step / time_step;

            let interpolated =
                Vect::lerp(&self.last_step_velocity, state.velocity(), fraction);
            let old = self.old_velocity;
            self.data.record(&old, &interpolated);
            self.transition_start += self.time_interval;
            self.old_velocity = interpolated;
        }

        self.last_step_time = t;
        self.last_step_velocity = *state.velocity();

        t < self.end_recording
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"velt002\n")?;
        io::write_u64(out, self.bin_count as u64)?;
        io::write_u64(out, self.dimension as u64)?;
        io::write_f64(out, self.time_interval)?;
        io::write_f64s(out, &self.data.bin_centers)?;
        self.data.counts.dump(out)?;
        Ok(())
    }
}

impl SharedObserver for VelocityTransitionObserver {}

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

    fn observer(interval: f64) -> VelocityTransitionObserver {
        VelocityTransitionObserver::new(
            2,
            interval,
            11,
            0.0,
            10.0,
            &[false, true],
            &[false, true],
            false,
            "velocity_transitions.dat".into(),
        )
        .unwrap()
    }

    #[test]
    fn masked_axes_collapse_to_single_bins() {
        let obs = observer(0.5);
        assert_eq!(obs.data.counts.extents(), &[1, 11, 1, 11]);
    }

    #[test]
    fn counts_transitions_at_interval_boundaries() {
        let mut obs = observer(0.5);
        let ic = ic_with_velocity(&[1.0, 0.0]);

        obs.start_trajectory(&ic, 1);
        // constant velocity for t in [0, 1]: expect transitions at 0.5 and 1.0
        for step in 0..=10 {
            let t = step as f64 * 0.1;
            obs.watch(&state_with_velocity(&[1.0, 0.0]), t);
        }

        let total: u64 = obs.data.counts.as_slice().iter().map(|&c| c as u64).sum();
        assert_eq!(total, 2);

        // v_y = 0 lands in the centre bin on both axes
        let centre = obs.data.counts.at(&[0, 5, 0, 5]);
        assert_eq!(centre, 2);
    }

    #[test]
    fn sparse_samples_do_not_skip_boundaries() {
        let mut obs = observer(0.25);
        let ic = ic_with_velocity(&[1.0, 0.0]);
        obs.start_trajectory(&ic, 1);

        // one giant step across four interval boundaries
        obs.watch(&state_with_velocity(&[1.0, 0.0]), 0.0);
        obs.watch(&state_with_velocity(&[1.0, 0.0]), 1.05);

        let total: u64 = obs.data.counts.as_slice().iter().map(|&c| c as u64).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn save_header_and_metadata() {
        let mut obs = observer(0.5);
        let mut buf = Vec::new();
        obs.save(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"velt002\n");
    }

    #[test]
    fn rejects_nonpositive_interval() {
        assert!(VelocityTransitionObserver::new(
            2,
            0.0,
            10,
            0.0,
            1.0,
            &[true, true],
            &[true, true],
            false,
            "x".into()
        )
        .is_err());
    }
}
