//! ODE stepping for the tracer.
//!
//! Observation points are spaced at the caller's step `dt`; the adaptive
//! stepper is free to take as many internal substeps as the error control
//! demands between two observations.

use crate::error::{Error, Result};
use crate::tracer::dynamics::OutOfDomain;

/// Right-hand side of an ODE. [`RayDynamics`](crate::tracer::dynamics::RayDynamics)
/// implementations provide this through a thin adapter.
pub trait OdeSystem {
    fn apply(&self, t: f64, x: &[f64], dxdt: &mut [f64]) -> std::result::Result<(), OutOfDomain>;
}

impl<F> OdeSystem for F
where
    F: Fn(f64, &[f64], &mut [f64]) -> std::result::Result<(), OutOfDomain>,
{
    fn apply(&self, t: f64, x: &[f64], dxdt: &mut [f64]) -> std::result::Result<(), OutOfDomain> {
        self(t, x, dxdt)
    }
}

/// Why a trajectory integration returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryEnd {
    /// Reached the end time.
    Finished,
    /// An observer declined further samples.
    Stopped,
    /// The dynamics raised [`OutOfDomain`].
    LeftDomain,
}

enum Attempt {
    Accepted { dt_next: f64 },
    Rejected { dt_next: f64 },
}

/// Runge–Kutta–Cash–Karp 5(4) with step-doubling error control.
///
/// The error measure follows the classic controlled-stepper convention:
/// `max_i |e_i| / (ε_abs + ε_rel · (|x_i| + dt·|ẋ_i|))`, accept when at most
/// one.
pub struct CashKarp54 {
    k: [Vec<f64>; 6],
    tmp: Vec<f64>,
    dxdt: Vec<f64>,
    abs_tol: f64,
    rel_tol: f64,
}

const C: [f64; 6] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 3.0 / 5.0, 1.0, 7.0 / 8.0];

const A2: [f64; 1] = [1.0 / 5.0];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [3.0 / 10.0, -9.0 / 10.0, 6.0 / 5.0];
const A5: [f64; 4] = [-11.0 / 54.0, 5.0 / 2.0, -70.0 / 27.0, 35.0 / 27.0];
const A6: [f64; 5] = [
    1631.0 / 55296.0,
    175.0 / 512.0,
    575.0 / 13824.0,
    44275.0 / 110592.0,
    253.0 / 4096.0,
];

/// 5th-order weights.
const B5: [f64; 6] = [
    37.0 / 378.0,
    0.0,
    250.0 / 621.0,
    125.0 / 594.0,
    0.0,
    512.0 / 1771.0,
];

/// Embedded 4th-order weights.
const B4: [f64; 6] = [
    2825.0 / 27648.0,
    0.0,
    18575.0 / 48384.0,
    13525.0 / 55296.0,
    277.0 / 14336.0,
    1.0 / 4.0,
];

impl CashKarp54 {
    pub fn new(len: usize, abs_tol: f64, rel_tol: f64) -> Self {
        CashKarp54 {
            k: std::array::from_fn(|_| vec![0.0; len]),
            tmp: vec![0.0; len],
            dxdt: vec![0.0; len],
            abs_tol,
            rel_tol,
        }
    }

    fn stage(
        &mut self,
        system: &impl OdeSystem,
        stage: usize,
        coeffs: &[f64],
        t: f64,
        state: &[f64],
        dt: f64,
    ) -> std::result::Result<(), OutOfDomain> {
        for i in 0..state.len() {
            let mut sum = 0.0;
            for (j, &a) in coeffs.iter().enumerate() {
                sum += a * self.k[j][i];
            }
            self.tmp[i] = state[i] + dt * sum;
        }
        system.apply(t + C[stage] * dt, &self.tmp, &mut self.k[stage])
    }

    fn try_step(
        &mut self,
        system: &impl OdeSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> std::result::Result<Attempt, OutOfDomain> {
        system.apply(*t, state, &mut self.k[0])?;
        self.dxdt.copy_from_slice(&self.k[0]);

        self.stage(system, 1, &A2, *t, state, dt)?;
        self.stage(system, 2, &A3, *t, state, dt)?;
        self.stage(system, 3, &A4, *t, state, dt)?;
        self.stage(system, 4, &A5, *t, state, dt)?;
        self.stage(system, 5, &A6, *t, state, dt)?;

        let mut error = 0.0f64;
        for i in 0..state.len() {
            let mut fifth = 0.0;
            let mut fourth = 0.0;
            for j in 0..6 {
                fifth += B5[j] * self.k[j][i];
                fourth += B4[j] * self.k[j][i];
            }
            self.tmp[i] = state[i] + dt * fifth;

            let scale =
                self.abs_tol + self.rel_tol * (state[i].abs() + dt.abs() * self.dxdt[i].abs());
            error = error.max((dt * (fifth - fourth)).abs() / scale);
        }

        if error <= 1.0 {
            state.copy_from_slice(&self.tmp);
            *t += dt;
            let dt_next = if error < 0.5 {
                dt * (0.9 * error.max(1e-16).powf(-0.2)).min(5.0)
            } else {
                dt
            };
            Ok(Attempt::Accepted { dt_next })
        } else {
            Ok(Attempt::Rejected {
                dt_next: dt * (0.9 * error.powf(-0.25)).max(0.2),
            })
        }
    }
}

/// Integrates from `t = 0` to `end_time`, observing at multiples of `dt`.
/// The observer aborts the trajectory by returning `false`.
///
/// Observation times are computed as exact multiples so accumulated rounding
/// cannot produce degenerate residual steps at an interval boundary.
pub fn integrate_adaptive<S: OdeSystem>(
    stepper: &mut CashKarp54,
    system: &S,
    state: &mut [f64],
    end_time: f64,
    dt: f64,
    observe: &mut impl FnMut(&[f64], f64) -> bool,
) -> Result<TrajectoryEnd> {
    if !observe(state, 0.0) {
        return Ok(TrajectoryEnd::Stopped);
    }
    if end_time <= 0.0 {
        return Ok(TrajectoryEnd::Finished);
    }

    let mut t = 0.0;
    let mut dt_try = dt;
    let dt_floor = dt * 1e-12;

    for interval in 1u64.. {
        let target = (interval as f64 * dt).min(end_time);

        while target - t > dt_floor {
            let step = dt_try.min(target - t);
            match stepper.try_step(system, &mut t, state, step) {
                Ok(Attempt::Accepted { dt_next }) => dt_try = dt_next,
                Ok(Attempt::Rejected { dt_next }) => {
                    dt_try = dt_next;
                    if dt_try < dt_floor {
                        return Err(Error::domain(
                            "adaptive step size underflow, error bounds may be unreachable",
                        ));
                    }
                }
                Err(OutOfDomain) => return Ok(TrajectoryEnd::LeftDomain),
            }
        }
        t = target;

        if !observe(state, t) {
            return Ok(TrajectoryEnd::Stopped);
        }
        if target >= end_time {
            break;
        }
    }
    Ok(TrajectoryEnd::Finished)
}

/// Fixed-step explicit Euler, observing after every step.
pub fn integrate_euler<S: OdeSystem>(
    system: &S,
    state: &mut [f64],
    end_time: f64,
    dt: f64,
    observe: &mut impl FnMut(&[f64], f64) -> bool,
) -> Result<TrajectoryEnd> {
    if !observe(state, 0.0) {
        return Ok(TrajectoryEnd::Stopped);
    }
    if end_time <= 0.0 {
        return Ok(TrajectoryEnd::Finished);
    }

    let mut dxdt = vec![0.0; state.len()];
    let mut t = 0.0;
    for step_index in 1u64.. {
        let t_next = (step_index as f64 * dt).min(end_time);
        let step = t_next - t;
        if system.apply(t, state, &mut dxdt).is_err() {
            return Ok(TrajectoryEnd::LeftDomain);
        }
        for i in 0..state.len() {
            state[i] += step * dxdt[i];
        }
        t = t_next;

        if !observe(state, t) {
            return Ok(TrajectoryEnd::Stopped);
        }
        if t >= end_time {
            break;
        }
    }
    Ok(TrajectoryEnd::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn oscillator(
    ) -> impl Fn(f64, &[f64], &mut [f64]) -> std::result::Result<(), OutOfDomain> {
        |_t: f64, x: &[f64], dxdt: &mut [f64]| {
            dxdt[0] = x[1];
            dxdt[1] = -x[0];
            Ok(())
        }
    }

    #[test]
    fn adaptive_integrates_harmonic_oscillator_accurately() {
        let system = oscillator();
        let mut stepper = CashKarp54::new(2, 1e-10, 1e-10);
        let mut state = [1.0, 0.0];

        let end = integrate_adaptive(&mut stepper, &system, &mut state, TAU, 0.1, &mut |_, _| {
            true
        })
        .unwrap();

        assert_eq!(end, TrajectoryEnd::Finished);
        assert!((state[0] - 1.0).abs() < 1e-8, "x = {}", state[0]);
        assert!(state[1].abs() < 1e-8, "v = {}", state[1]);
    }

    #[test]
    fn observation_times_are_regular() {
        let system = oscillator();
        let mut stepper = CashKarp54::new(2, 1e-8, 1e-8);
        let mut state = [1.0, 0.0];

        let mut times = Vec::new();
        integrate_adaptive(&mut stepper, &system, &mut state, 1.0, 0.25, &mut |_, t| {
            times.push(t);
            true
        })
        .unwrap();

        assert_eq!(times.len(), 5);
        for (i, &t) in times.iter().enumerate() {
            assert!((t - 0.25 * i as f64).abs() < 1e-12);
        }
    }

    #[test]
    fn observer_stop_ends_the_trajectory() {
        let system = oscillator();
        let mut stepper = CashKarp54::new(2, 1e-8, 1e-8);
        let mut state = [1.0, 0.0];

        let mut calls = 0;
        let end = integrate_adaptive(&mut stepper, &system, &mut state, 10.0, 0.1, &mut |_, _| {
            calls += 1;
            calls < 3
        })
        .unwrap();

        assert_eq!(end, TrajectoryEnd::Stopped);
        assert_eq!(calls, 3);
    }

    #[test]
    fn out_of_domain_ends_the_trajectory() {
        let system = |_t: f64, x: &[f64], dxdt: &mut [f64]| {
            if x[0] > 0.5 {
                return Err(OutOfDomain);
            }
            dxdt[0] = 1.0;
            Ok(())
        };
        let mut stepper = CashKarp54::new(1, 1e-8, 1e-8);
        let mut state = [0.0];

        let end =
            integrate_adaptive(&mut stepper, &system, &mut state, 10.0, 0.1, &mut |_, _| true)
                .unwrap();
        assert_eq!(end, TrajectoryEnd::LeftDomain);
        assert!(state[0] <= 0.6);
    }

    #[test]
    fn euler_converges_first_order() {
        let system = oscillator();

        let mut coarse = [1.0, 0.0];
        integrate_euler(&system, &mut coarse, 1.0, 1e-2, &mut |_, _| true).unwrap();
        let mut fine = [1.0, 0.0];
        integrate_euler(&system, &mut fine, 1.0, 1e-3, &mut |_, _| true).unwrap();

        let exact = (1.0f64.cos(), -(1.0f64.sin()));
        let coarse_err = (coarse[0] - exact.0).abs();
        let fine_err = (fine[0] - exact.0).abs();
        assert!(fine_err < coarse_err);
        assert!(fine_err < 1e-2);
        assert!((fine[1] - exact.1).abs() < 1e-2);
    }
}
