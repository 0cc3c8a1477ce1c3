//! Energy-conservation bookkeeping per trajectory.

use std::any::Any;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::tracer::dynamics::RayDynamics;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::State;

/// Aggregate energy-drift statistics, as written to the save file.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnergyStats {
    pub count: u64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
}

/// Records the relative energy drift `|E_end − E_start| / E_start` of every
/// trajectory; the aggregate is the tracer's primary quality diagnostic.
pub struct EnergyErrorObserver {
    file_name: String,
    dynamics: Option<Arc<dyn RayDynamics>>,
    initial_energy: f64,
    count: u64,
    sum: f64,
    max: f64,
}

impl EnergyErrorObserver {
    pub fn new(file_name: String) -> Self {
        EnergyErrorObserver {
            file_name,
            dynamics: None,
            initial_energy: 0.0,
            count: 0,
            sum: 0.0,
            max: 0.0,
        }
    }

    pub fn maximum_error(&self) -> f64 {
        self.max
    }

    pub fn mean_error(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn stats(&self) -> EnergyStats {
        EnergyStats {
            count: self.count,
            max: self.max,
            sum: self.sum,
            mean: self.mean_error(),
        }
    }
}

impl Observer for EnergyErrorObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn init(&mut self, dynamics: &Arc<dyn RayDynamics>) {
        self.dynamics = Some(Arc::clone(dynamics));
    }

    fn start_tracing(&mut self) -> Result<()> {
        if self.dynamics.is_none() {
            return Err(Error::programming(
                "starting energy observation before dynamics have been set",
            ));
        }
        Ok(())
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, _trajectory: u64) {
        let dynamics = self.dynamics.as_ref().expect("energy observer not initialised");
        self.initial_energy = dynamics.energy(&ic.state);
    }

    fn watch(&mut self, _state: &State, _t: f64) -> bool {
        true
    }

    fn end_trajectory(&mut self, final_state: &State) {
        let dynamics = self.dynamics.as_ref().expect("energy observer not initialised");
        let final_energy = dynamics.energy(final_state);
        let relative = ((self.initial_energy - final_energy) / self.initial_energy).abs();

        self.count += 1;
        self.sum += relative;
        self.max = self.max.max(relative);
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, &self.stats())
            .map_err(|e| Error::format(format!("could not encode energy statistics: {e}")))?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

impl LocalObserver for EnergyErrorObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        let mut clone = EnergyErrorObserver::new(self.file_name.clone());
        clone.dynamics = self.dynamics.clone();
        Box::new(clone)
    }

    fn combine(&mut self, other: Box<dyn Any>) {
        let other = other
            .downcast::<EnergyErrorObserver>()
            .expect("combining observers of different types");
        self.count += other.count;
        self.sum += other.sum;
        self.max = self.max.max(other.max);
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::state::Vect;

    struct Kinetic;

    impl RayDynamics for Kinetic {
        fn dimension(&self) -> usize {
            2
        }
        fn has_monodromy(&self) -> bool {
            false
        }
        fn periodic_boundary(&self) -> bool {
            true
        }
        fn state_update(
            &self,
            _x: &[f64],
            dxdt: &mut [f64],
            _t: f64,
        ) -> std::result::Result<(), crate::tracer::dynamics::OutOfDomain> {
            dxdt.fill(0.0);
            Ok(())
        }
        fn normalize_energy(&self, _state: &mut State, _e: f64) -> Result<()> {
            Ok(())
        }
        fn energy(&self, state: &State) -> f64 {
            0.5 * state.velocity().dot(state.velocity())
        }
    }

    fn state_with_speed(speed: f64) -> State {
        let mut state = State::new(2);
        *state.velocity_mut() = Vect::from_slice(&[speed, 0.0]);
        state
    }

    #[test]
    fn records_relative_drift_and_reduces() {
        let dynamics: Arc<dyn RayDynamics> = Arc::new(Kinetic);
        let mut root = EnergyErrorObserver::new("energy.json".into());
        root.init(&dynamics);

        let mut clone_box = root.clone_for_thread();
        let ic = InitialCondition {
            state: state_with_speed(1.0),
            deltas: Vec::new(),
            manifold_index: vec![0],
            manifold_coordinates: vec![0.0],
        };

        // E from 0.5 to 0.605: 21% relative error
        clone_box.start_trajectory(&ic, 1);
        clone_box.end_trajectory(&state_with_speed(1.1));
        // exact conservation
        clone_box.start_trajectory(&ic, 2);
        clone_box.end_trajectory(&state_with_speed(1.0));

        root.combine(clone_box.into_any());
        assert_eq!(root.count, 2);
        assert!((root.maximum_error() - 0.21).abs() < 1e-12);
        assert!((root.mean_error() - 0.105).abs() < 1e-12);
    }

    #[test]
    fn save_emits_json_stats() {
        let dynamics: Arc<dyn RayDynamics> = Arc::new(Kinetic);
        let mut observer = EnergyErrorObserver::new("energy.json".into());
        observer.init(&dynamics);

        let mut buf = Vec::new();
        observer.save(&mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["count"], 0);
    }

    #[test]
    fn requires_dynamics_before_tracing() {
        let mut observer = EnergyErrorObserver::new("energy.json".into());
        assert!(observer.start_tracing().is_err());
    }
}
