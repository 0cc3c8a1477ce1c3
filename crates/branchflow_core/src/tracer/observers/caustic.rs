//! Caustic detection through sign changes of the monodromy area form.

use std::any::Any;
use std::io::Write;

use crate::error::{Error, Result};
use crate::interp::lerp;
use crate::io;
use crate::tracer::ic::InitialCondition;
use crate::tracer::observers::{LocalObserver, Observer};
use crate::tracer::state::{State, Vect};

/// One detected caustic.
#[derive(Debug, Clone)]
pub struct CausticRecord {
    pub trajectory: u64,
    pub position: Vect,
    pub initial_position: Vect,
    pub velocity: Vect,
    pub initial_velocity: Vect,
    pub time: f64,
    /// Running caustic count on the trajectory, starting at 1.
    pub index: u8,
}

impl CausticRecord {
    fn write(&self, out: &mut dyn Write) -> Result<()> {
        io::write_u64(out, self.trajectory)?;
        io::write_f64s(out, self.position.as_slice())?;
        io::write_f64s(out, self.initial_position.as_slice())?;
        io::write_f64s(out, self.velocity.as_slice())?;
        io::write_f64s(out, self.initial_velocity.as_slice())?;
        io::write_f64(out, self.time)?;
        out.write_all(&[self.index])?;
        Ok(())
    }
}

/// Thread-local observer recording every zero of the signed area (2D) or
/// volume (3D) spanned by the advected initial-condition deltas and the
/// velocity. Requires monodromy integration.
pub struct CausticObserver {
    dimension: usize,
    break_on_first: bool,
    file_name: String,

    records: Vec<CausticRecord>,
    particle_number: u64,

    // per-trajectory state
    deltas: Vec<[f64; 6]>,
    initial_position: Vect,
    initial_velocity: Vect,
    old_area: f64,
    old_position: Vect,
    old_velocity: Vect,
    old_time: f64,
    caustic_count: u8,
}

impl CausticObserver {
    pub fn new(dimension: usize, break_on_first: bool, file_name: String) -> Result<Self> {
        if !(2..=3).contains(&dimension) {
            return Err(Error::shape(format!(
                "caustic observation requires dimension 2 or 3, got {dimension}"
            )));
        }
        Ok(CausticObserver {
            dimension,
            break_on_first,
            file_name,
            records: Vec::new(),
            particle_number: 0,
            deltas: Vec::new(),
            initial_position: Vect::zeros(dimension),
            initial_velocity: Vect::zeros(dimension),
            old_area: 0.0,
            old_position: Vect::zeros(dimension),
            old_velocity: Vect::zeros(dimension),
            old_time: 0.0,
            caustic_count: 0,
        })
    }

    pub fn records(&self) -> &[CausticRecord] {
        &self.records
    }

    /// `M · δ` for the row-major `2D×2D` monodromy matrix.
    fn advect(&self, matrix: &[f64], delta: &[f64; 6]) -> [f64; 6] {
        let n = 2 * self.dimension;
        let mut out = [0.0; 6];
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..n {
                sum += matrix[i * n + j] * delta[j];
            }
            out[i] = sum;
        }
        out
    }

    fn signed_area(&self, state: &State) -> f64 {
        let velocity = state.velocity();
        if self.dimension == 2 {
            let advected = self.advect(state.matrix(), &self.deltas[0]);
            advected[0] * velocity[1] - advected[1] * velocity[0]
        } else {
            let a = self.advect(state.matrix(), &self.deltas[0]);
            let b = self.advect(state.matrix(), &self.deltas[1]);
            let cross = Vect::cross(&Vect::from_slice(&a[..3]), &Vect::from_slice(&b[..3]));
            cross.dot(velocity)
        }
    }
}

impl Observer for CausticObserver {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn start_trajectory(&mut self, ic: &InitialCondition, trajectory: u64) {
        self.old_area = 0.0;
        self.caustic_count = 0;
        self.particle_number = trajectory;

        self.initial_position = *ic.state.position();
        self.initial_velocity = *ic.state.velocity();
        self.deltas.clear();
        for delta in &ic.deltas {
            self.deltas.push(delta.phase_space());
        }
    }

    fn watch(&mut self, state: &State, t: f64) -> bool {
        if self.deltas.len() < self.dimension - 1 {
            // degenerate manifold, nothing to advect
            return false;
        }
        let signed_area = self.signed_area(state);

        // skip the initial frame: spherical starts have zero area at t = 0,
        // which is not a caustic
        if t > 0.0 && (signed_area * self.old_area < 0.0 || signed_area == 0.0) {
            // linear interpolation of the crossing A(t + p·Δ) = 0
            let p = -self.old_area / (signed_area - self.old_area);
            self.caustic_count = self.caustic_count.saturating_add(1);

            self.records.push(CausticRecord {
                trajectory: self.particle_number,
                position: Vect::lerp(&self.old_position, state.position(), p),
                initial_position: self.initial_position,
                velocity: Vect::lerp(&self.old_velocity, state.velocity(), p),
                initial_velocity: self.initial_velocity,
                time: lerp(self.old_time, t, p),
                index: self.caustic_count,
            });

            if self.break_on_first {
                return false;
            }
        }

        self.old_area = signed_area;
        self.old_position = *state.position();
        self.old_velocity = *state.velocity();
        self.old_time = t;
        true
    }

    fn save(&mut self, out: &mut dyn Write) -> Result<()> {
        out.write_all(b"caus001\n")?;
        io::write_u64(out, self.particle_number)?;
        io::write_u64(out, self.dimension as u64)?;
        io::write_u64(out, self.records.len() as u64)?;
        for record in &self.records {
            record.write(out)?;
        }
        Ok(())
    }
}

impl LocalObserver for CausticObserver {
    fn clone_for_thread(&self) -> Box<dyn LocalObserver> {
        Box::new(
            CausticObserver::new(self.dimension, self.break_on_first, self.file_name.clone())
                .expect("cloning a valid caustic observer"),
        )
    }

    fn combine(&mut self, other: Box<dyn Any>) {
        let other = other
            .downcast::<CausticObserver>()
            .expect("combining observers of different types");
        self.records.extend(other.records);
        // the largest trajectory id seen tracks the particle count
        self.particle_number = self.particle_number.max(other.particle_number);
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
