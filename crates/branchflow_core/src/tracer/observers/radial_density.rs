//! Angular densities at fixed radii from each ray's starting point.

use std::any::Any;
use std::f64::consts::TAU;
use std::io::Write;

use crate::error::{Error, Result};
use crate::grid::{Grid, IndexMode};
use crate::io;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::{State, Vect};

/// Thread-local observer binning the angle under which a ray crosses each of
/// a list of circles around its starting point. The crossing position is
/// interpolated between the two samples bracketing the radius, so the bin is
/// exact up to the linearity of the step. Only meaningful in two dimensions.
pub struct RadialDensityObserver {
    file_name: String,
    resolution: usize,
    radii: Vec<f64>,
    counts: Vec<Grid<u32>>,

    // per-trajectory state
    start_position: Vect,
    last_position: Vect,
    last_radius: f64,
    radius_index: usize,
}

impl RadialDensityObserver {
    pub fn new(resolution: usize, mut radii: Vec<f64>, file_name: String) -> Result<Self> {
        if radii.is_empty() {
            return Err(Error::domain(
                "empty list of radii supplied for radial density observation",
            ));
        }
        for &radius in &radii {
            if radius <= 0.0 {
                return Err(Error::domain(format!(
                    "non-positive radius {radius} supplied for radial density observation"
                )));
            }
        }
        if resolution == 0 {
            return Err(Error::domain("radial density needs at least one angular bin"));
        }
        radii.sort_by(|a, b| a.partial_cmp(b).expect("radii are finite"));

        let mut counts = Vec::with_capacity(radii.len());
        for _ in &radii {
            counts.push(Grid::try_new(&[resolution], IndexMode::Identity)?);
        }

        Ok(RadialDensityObserver {
            file_name,
            resolution,
            radii,
            counts,
            start_position: Vect::zeros(2),
            last_position: Vect::zeros(2),
            last_radius: 0.0,
            radius_index: 0,
        })
    }

    pub fn counts(&self) -> &[Grid<u32>] {
        &self.counts
    }
}

impl Observer for RadialDensityObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, _trajectory: u64) {
        self.start_position = *ic.state.position();
        self.last_position = Vect::zeros(2);
        self.last_radius = 0.0;
        self.radius_index = 0;
    }

    fn watch(&mut self, state: &State, _t: f64) -> bool {
        let delta = state.position().sub(&self.start_position);
        let radius = delta.norm();

        if radius > self.radii[self.radius_index] {
            // interpolate the crossing of the circle between the samples
            let fraction =
                (self.radii[self.radius_index] - self.last_radius) / (radius - self.last_radius);
            let crossing = Vect::lerp(&self.last_position, &delta, fraction);

            let angle = crossing[1].atan2(crossing[0]);
            let mut bin = ((angle / TAU + 0.5) * self.resolution as f64).floor() as usize;
            if bin >= self.resolution {
                bin = self.resolution - 1;
            }
            self.counts[self.radius_index].data_mut()[bin] += 1;

            if self.radius_index == self.radii.len() - 1 {
                return false;
            }
            self.radius_index += 1;
        }

        self.last_radius = radius;
        self.last_position = delta;
        true
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"rade001\n")?;
        io::write_u64(out, self.radii.len() as u64)?;
        io::write_u64(out, self.resolution as u64)?;
        io::write_f64s(out, &self.radii)?;
        for counts in &self.counts {
            counts.dump(out)?;
        }
        Ok(())
    }
}

impl LocalObserver for RadialDensityObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        Box::new(
            RadialDensityObserver::new(self.resolution, self.radii.clone(), self.file_name.clone())
                .expect("cloning a valid radial density observer"),
        )
    }

    fn combine(&mut self, other: Box<dyn Any>) {
        let other = other
            .downcast::<RadialDensityObserver>()
            .expect("combining observers of different types");
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
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
    use crate::tracer::state::RayState;

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
            manifold_coordinates: vec![0.0],
        }
    }

    #[test]
    fn crossing_lands_in_the_forward_bin() {
        let mut obs =
            RadialDensityObserver::new(8, vec![0.2, 0.4], "angular_density.dat".into()).unwrap();
        obs.start_trajectory(&ic_at(0.5, 0.5), 1);

        // march along +x; angle 0 maps to the bin just past the centre
        for step in 0..=10 {
            let x = 0.5 + 0.05 * step as f64;
            if !obs.watch(&state_at(x, 0.5), step as f64 * 0.1) {
                break;
            }
        }

        let expected_bin = 8 / 2;
        assert_eq!(obs.counts()[0].as_slice()[expected_bin], 1);
        assert_eq!(obs.counts()[1].as_slice()[expected_bin], 1);
        let total: u32 = obs
            .counts()
            .iter()
            .flat_map(|grid| grid.as_slice())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn trajectory_stops_after_the_outermost_radius() {
        let mut obs =
            RadialDensityObserver::new(4, vec![0.1], "angular_density.dat".into()).unwrap();
        obs.start_trajectory(&ic_at(0.0, 0.0), 1);

        assert!(obs.watch(&state_at(0.05, 0.0), 0.1));
        assert!(!obs.watch(&state_at(0.2, 0.0), 0.2));
    }

    #[test]
    fn crossing_angle_is_interpolated() {
        // the ray jumps diagonally across the circle; the interpolated
        // crossing lies between the two samples
        let mut obs =
            RadialDensityObserver::new(360, vec![1.0], "angular_density.dat".into()).unwrap();
        obs.start_trajectory(&ic_at(0.0, 0.0), 1);

        obs.watch(&state_at(0.9, 0.0), 0.0);
        obs.watch(&state_at(0.9, 0.9), 1.0);

        // crossing at y ≈ 0.24: angle atan2(0.24, 0.9) ≈ 15°
        let hit = obs.counts()[0]
            .as_slice()
            .iter()
            .position(|&c| c > 0)
            .unwrap();
        let angle = (hit as f64 + 0.5) - 180.0;
        assert!((angle - 15.0).abs() < 2.0, "angle {angle}");
    }

    #[test]
    fn radii_are_sorted_and_validated() {
        let obs =
            RadialDensityObserver::new(8, vec![0.4, 0.1, 0.2], "a.dat".into()).unwrap();
        assert_eq!(obs.radii, vec![0.1, 0.2, 0.4]);

        assert!(RadialDensityObserver::new(8, vec![], "a.dat".into()).is_err());
        assert!(RadialDensityObserver::new(8, vec![-0.5], "a.dat".into()).is_err());
    }

    #[test]
    fn combine_adds_counts_per_radius() {
        let mut root = RadialDensityObserver::new(4, vec![0.1], "a.dat".into()).unwrap();
        let mut clone = RadialDensityObserver::new(4, vec![0.1], "a.dat".into()).unwrap();

        clone.start_trajectory(&ic_at(0.0, 0.0), 1);
        clone.watch(&state_at(0.05, 0.0), 0.0);
        clone.watch(&state_at(0.2, 0.0), 0.1);

        root.combine(Box::new(clone));
        let total: u32 = root.counts()[0].as_slice().iter().sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn save_format_header() {
        let mut obs = RadialDensityObserver::new(4, vec![0.1, 0.3], "a.dat".into()).unwrap();
        let mut buf = Vec::new();
        obs.save(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"rade001\n");
    }
}
