use anyhow::{Result, bail};
use nalgebra::{SMatrix, SVector};

/// A constant-velocity Kalman filter over `M` measured coordinates and `S = 2M` states.
///
/// The state is laid out as `[positions.., velocities..]` and advances with `dt = 1`.
/// Process and measurement noise are isotropic and supplied on every call so parameter
/// changes take effect immediately.
#[derive(Debug, Clone)]
pub struct KalmanFilter<const S: usize, const M: usize> {
    state: SVector<f64, S>,
    covariance: SMatrix<f64, S, S>,
    transition: SMatrix<f64, S, S>,
    observation: SMatrix<f64, M, S>,
}

impl<const S: usize, const M: usize> KalmanFilter<S, M> {
    pub fn new(measurement: SVector<f64, M>) -> Self {
        const { assert!(S == 2 * M, "state must hold a position and a velocity per axis") };

        let mut transition = SMatrix::<f64, S, S>::identity();
        let mut observation = SMatrix::<f64, M, S>::zeros();
        for i in 0..M {
            transition[(i, i + M)] = 1.0;
            observation[(i, i)] = 1.0;
        }

        let mut state = SVector::<f64, S>::zeros();
        state.fixed_rows_mut::<M>(0).copy_from(&measurement);

        Self {
            state,
            covariance: SMatrix::identity(),
            transition,
            observation,
        }
    }

    pub fn predict(&mut self, q: f64) {
        let noise = SMatrix::<f64, S, S>::identity() * q;
        self.state = self.transition * self.state;
        self.covariance = self.transition * self.covariance * self.transition.transpose() + noise;
    }

    pub fn update(&mut self, measurement: SVector<f64, M>, r: f64) -> Result<()> {
        let noise = SMatrix::<f64, M, M>::identity() * r;
        let projected_cov =
            self.observation * self.covariance * self.observation.transpose() + noise;
        let Some(chol) = projected_cov.cholesky() else {
            bail!("projected covariance is not positive definite");
        };
        // K = P Hᵀ S⁻¹, solved as Kᵀ = S⁻¹ H P since both P and S are symmetric
        let gain = chol.solve(&(self.observation * self.covariance)).transpose();
        let innovation = measurement - self.observation * self.state;

        self.state += gain * innovation;
        self.covariance =
            (SMatrix::<f64, S, S>::identity() - gain * self.observation) * self.covariance;
        if !self.state.iter().all(|v| v.is_finite()) {
            bail!("filter state diverged");
        }
        Ok(())
    }

    #[inline]
    pub fn position(&self) -> SVector<f64, M> {
        self.state.fixed_rows::<M>(0).into_owned()
    }

    #[inline]
    pub fn velocity(&self) -> SVector<f64, M> {
        self.state.fixed_rows::<M>(M).into_owned()
    }
}
