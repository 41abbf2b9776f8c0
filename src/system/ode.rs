//! Adaptive Dormand–Prince 5(4) integrator used by continuous-time systems.
//!
//! Only what a system needs to advance between output times is provided:
//! embedded error control, PI step-size control and exact landing on
//! caller-supplied critical times (discontinuities in forcing terms).

use crate::error::{MontyError, Result};

/// Step-size control for continuous-time systems.
#[derive(Debug, Clone, PartialEq)]
pub struct OdeControl {
    pub atol: f64,
    pub rtol: f64,
    pub step_size_min: f64,
    pub step_size_max: f64,
    pub max_steps: usize,
    /// Times at which the integrator is forced to land exactly.
    pub critical_times: Vec<f64>,
}

impl Default for OdeControl {
    fn default() -> Self {
        Self {
            atol: 1e-6,
            rtol: 1e-6,
            step_size_min: 1e-8,
            step_size_max: f64::INFINITY,
            max_steps: 10_000,
            critical_times: Vec::new(),
        }
    }
}

impl OdeControl {
    pub fn with_tolerance(mut self, atol: f64, rtol: f64) -> Self {
        self.atol = atol;
        self.rtol = rtol;
        self
    }

    pub fn with_critical_times(mut self, mut times: Vec<f64>) -> Self {
        times.sort_by(f64::total_cmp);
        times.dedup();
        self.critical_times = times;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.atol > 0.0 && self.rtol > 0.0) {
            return Err(MontyError::invalid("ode tolerances must be positive"));
        }
        if !(self.step_size_min > 0.0 && self.step_size_max >= self.step_size_min) {
            return Err(MontyError::invalid("require 0 < step_size_min <= step_size_max"));
        }
        if self.max_steps == 0 {
            return Err(MontyError::invalid("max_steps must be positive"));
        }
        Ok(())
    }
}

// Dormand–Prince tableau.
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

// PI controller constants (Hairer & Wanner).
const SAFETY: f64 = 0.9;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 10.0;
const BETA: f64 = 0.04;
const ALPHA: f64 = 0.2 - 0.75 * BETA;

/// Work arrays for one trajectory. One solver per particle.
#[derive(Debug, Clone)]
pub(crate) struct OdeSolver {
    k: [Vec<f64>; 7],
    y_tmp: Vec<f64>,
    y_new: Vec<f64>,
    h: Option<f64>,
    err_prev: f64,
    pub(crate) n_steps: usize,
}

impl OdeSolver {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; n]),
            y_tmp: vec![0.0; n],
            y_new: vec![0.0; n],
            h: None,
            err_prev: 1e-4,
            n_steps: 0,
        }
    }

    /// Forget the step size history, e.g. after the state was overwritten.
    pub(crate) fn reset(&mut self) {
        self.h = None;
        self.err_prev = 1e-4;
    }

    /// Integrate `y` from `t0` to `t1`, landing exactly on every critical
    /// time in between.
    pub(crate) fn integrate<F>(
        &mut self,
        rhs: &F,
        t0: f64,
        t1: f64,
        y: &mut [f64],
        control: &OdeControl,
    ) -> Result<()>
    where
        F: Fn(f64, &[f64], &mut [f64]) -> Result<()>,
    {
        let mut t = t0;
        let stops = control
            .critical_times
            .iter()
            .copied()
            .filter(|&c| c > t0 && c < t1)
            .chain(std::iter::once(t1));
        for stop in stops {
            self.integrate_segment(rhs, t, stop, y, control)?;
            if stop < t1 {
                // The right-hand side may be discontinuous here.
                self.reset();
            }
            t = stop;
        }
        Ok(())
    }

    fn integrate_segment<F>(
        &mut self,
        rhs: &F,
        t0: f64,
        t1: f64,
        y: &mut [f64],
        control: &OdeControl,
    ) -> Result<()>
    where
        F: Fn(f64, &[f64], &mut [f64]) -> Result<()>,
    {
        if t1 <= t0 {
            return Ok(());
        }
        let mut t = t0;
        rhs(t, y, &mut self.k[0])?;
        let mut h = match self.h {
            Some(h) => h,
            None => self.initial_step_size(y, control),
        };
        let mut steps = 0usize;
        while t < t1 {
            if steps >= control.max_steps {
                return Err(MontyError::invalid(format!(
                    "ode integration exceeded {} steps before reaching t = {t1}",
                    control.max_steps
                )));
            }
            h = h.clamp(control.step_size_min, control.step_size_max);
            let remaining = t1 - t;
            let landing = h >= remaining;
            let h_try = if landing { remaining } else { h };

            let err = self.try_step(rhs, t, h_try, y, control)?;
            steps += 1;
            self.n_steps += 1;

            if err <= 1.0 {
                t = if landing { t1 } else { t + h_try };
                y.copy_from_slice(&self.y_new);
                // First-same-as-last.
                let (first, rest) = self.k.split_at_mut(1);
                first[0].copy_from_slice(&rest[5]);
                let fac = if err == 0.0 {
                    FAC_MAX
                } else {
                    (SAFETY * err.powf(-ALPHA) * self.err_prev.powf(BETA)).clamp(FAC_MIN, FAC_MAX)
                };
                self.err_prev = err.max(1e-4);
                if !landing {
                    h = h_try * fac;
                }
            } else {
                let fac = (SAFETY * err.powf(-ALPHA)).clamp(FAC_MIN, 1.0);
                h = h_try * fac;
                if h < control.step_size_min {
                    return Err(MontyError::invalid(format!(
                        "ode step size fell below {} at t = {t}",
                        control.step_size_min
                    )));
                }
            }
        }
        self.h = Some(h);
        Ok(())
    }

    /// One Dormand–Prince step from `(t, y)` of size `h`, assuming `k[0]`
    /// holds `f(t, y)`. Leaves the proposal in `y_new` and `f(t+h, y_new)` in
    /// `k[6]`; returns the scaled error norm.
    fn try_step<F>(&mut self, rhs: &F, t: f64, h: f64, y: &[f64], control: &OdeControl) -> Result<f64>
    where
        F: Fn(f64, &[f64], &mut [f64]) -> Result<()>,
    {
        let n = y.len();
        let [k1, k2, k3, k4, k5, k6, k7] = &mut self.k;
        let y_tmp = &mut self.y_tmp;

        for i in 0..n {
            y_tmp[i] = y[i] + h * A21 * k1[i];
        }
        rhs(t + C2 * h, &y_tmp[..], &mut k2[..])?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        rhs(t + C3 * h, &y_tmp[..], &mut k3[..])?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        rhs(t + C4 * h, &y_tmp[..], &mut k4[..])?;
        for i in 0..n {
            y_tmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        rhs(t + C5 * h, &y_tmp[..], &mut k5[..])?;
        for i in 0..n {
            y_tmp[i] = y[i]
                + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        rhs(t + h, &y_tmp[..], &mut k6[..])?;
        for i in 0..n {
            self.y_new[i] = y[i]
                + h * (A71 * k1[i] + A73 * k3[i] + A74 * k4[i] + A75 * k5[i] + A76 * k6[i]);
        }
        rhs(t + h, &self.y_new[..], &mut k7[..])?;

        let mut acc = 0.0;
        for i in 0..n {
            let e = h
                * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let scale = control.atol + control.rtol * y[i].abs().max(self.y_new[i].abs());
            acc += (e / scale).powi(2);
        }
        let err = (acc / n.max(1) as f64).sqrt();
        Ok(if err.is_finite() { err } else { f64::INFINITY })
    }

    fn initial_step_size(&self, y: &[f64], control: &OdeControl) -> f64 {
        let n = y.len().max(1) as f64;
        let (mut d0, mut d1) = (0.0, 0.0);
        for (yi, fi) in y.iter().zip(&self.k[0]) {
            let scale = control.atol + control.rtol * yi.abs();
            d0 += (yi / scale).powi(2);
            d1 += (fi / scale).powi(2);
        }
        let (d0, d1) = ((d0 / n).sqrt(), (d1 / n).sqrt());
        let h = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        h.clamp(control.step_size_min, control.step_size_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_decay_matches_analytic_solution() {
        let rhs = |_t: f64, y: &[f64], dy: &mut [f64]| {
            dy[0] = -0.5 * y[0];
            Ok(())
        };
        let mut solver = OdeSolver::new(1);
        let mut y = vec![2.0];
        let control = OdeControl::default();
        solver.integrate(&rhs, 0.0, 4.0, &mut y, &control).unwrap();
        assert_relative_eq!(y[0], 2.0 * (-2.0f64).exp(), max_relative = 1e-5);
    }

    #[test]
    fn harmonic_oscillator_over_a_period() {
        let rhs = |_t: f64, y: &[f64], dy: &mut [f64]| {
            dy[0] = y[1];
            dy[1] = -y[0];
            Ok(())
        };
        let mut solver = OdeSolver::new(2);
        let mut y = vec![1.0, 0.0];
        let control = OdeControl::default().with_tolerance(1e-9, 1e-9);
        solver
            .integrate(&rhs, 0.0, 2.0 * std::f64::consts::PI, &mut y, &control)
            .unwrap();
        assert_relative_eq!(y[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(y[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn critical_times_resolve_narrow_pulses() {
        // A pulse of width 0.01 that an unconstrained stepper could jump over.
        let pulse = |t: f64| if (5.0..5.01).contains(&t) { 100.0 } else { 0.0 };
        let rhs = move |t: f64, _y: &[f64], dy: &mut [f64]| {
            dy[0] = pulse(t);
            Ok(())
        };
        let mut solver = OdeSolver::new(1);
        let mut y = vec![0.0];
        let control = OdeControl::default().with_critical_times(vec![5.0, 5.01]);
        solver.integrate(&rhs, 0.0, 10.0, &mut y, &control).unwrap();
        assert_relative_eq!(y[0], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn step_limit_is_reported() {
        let rhs = |_t: f64, y: &[f64], dy: &mut [f64]| {
            dy[0] = y[0];
            Ok(())
        };
        let mut solver = OdeSolver::new(1);
        let mut y = vec![1.0];
        let control = OdeControl::default().with_max_steps(2);
        assert!(solver.integrate(&rhs, 0.0, 100.0, &mut y, &control).is_err());
    }

    #[test]
    fn right_hand_side_errors_stop_integration() {
        let rhs = |t: f64, _y: &[f64], dy: &mut [f64]| {
            if t > 1.0 {
                return Err(MontyError::UnknownName("k".into()));
            }
            dy[0] = 1.0;
            Ok(())
        };
        let mut solver = OdeSolver::new(1);
        let mut y = vec![0.0];
        let err = solver.integrate(&rhs, 0.0, 2.0, &mut y, &OdeControl::default());
        assert!(matches!(err, Err(MontyError::UnknownName(_))));
    }

    #[test]
    fn invalid_control_is_rejected() {
        let control = OdeControl::default().with_tolerance(0.0, 1e-6);
        assert!(control.validate().is_err());
    }
}
