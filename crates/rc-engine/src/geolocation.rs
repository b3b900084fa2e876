//! Position estimation from distance observations.
//!
//! Radar rollcalls answer every submitted coordinate with the distance to
//! the instructor's device. Given three or more such answers, the device
//! position is recovered by least squares on a sphere: Gauss-Newton over
//! great-circle (haversine) distances, run entirely in 28-digit decimal
//! arithmetic so the 1e-12 degree finite-difference step stays meaningful.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps};

/// Minimum number of usable observations.
pub const MIN_OBSERVATIONS: usize = 3;

const MAX_ITERATIONS: usize = 30;

const ASIN_MAX_ITERATIONS: usize = 60;

/// Mean sphere radius in metres: 6 372 999.26.
fn earth_radius() -> Decimal {
    Decimal::new(637_299_926, 2)
}

/// Finite-difference step, in degrees: 1e-12.
fn jacobian_step() -> Decimal {
    Decimal::new(1, 12)
}

/// Convergence threshold on both step components, in degrees: 1e-14.
fn convergence_threshold() -> Decimal {
    Decimal::new(1, 14)
}

fn singular_tolerance() -> Decimal {
    Decimal::new(1, 18)
}

fn asin_tolerance() -> Decimal {
    Decimal::new(1, 26)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A coordinate that was submitted and the distance the platform reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceObservation {
    pub longitude: f64,
    pub latitude: f64,
    /// Metres.
    pub distance: f64,
}

impl DistanceObservation {
    pub fn new(longitude: f64, latitude: f64, distance: f64) -> Self {
        Self {
            longitude,
            latitude,
            distance,
        }
    }

    fn is_usable(&self) -> bool {
        self.distance.is_finite()
            && self.distance > 0.0
            && self.longitude.is_finite()
            && self.latitude.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub longitude: f64,
    pub latitude: f64,
    /// Root-mean-square distance residual at the estimate, in metres.
    pub rms: f64,
    pub iterations: usize,
    /// Observations that took part in the fit.
    pub used: usize,
    /// The normal equations became singular; the estimate is the last
    /// well-defined iterate.
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EstimateError {
    #[error("need at least {MIN_OBSERVATIONS} usable observations, got {usable}")]
    InsufficientObservations { usable: usize },

    #[error("numeric failure: {0}")]
    Numeric(&'static str),
}

// ---------------------------------------------------------------------------
// Decimal geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Point {
    lon: Decimal,
    lat: Decimal,
    d: Decimal,
}

fn to_decimal(v: f64) -> Result<Decimal, EstimateError> {
    Decimal::from_f64(v).ok_or(EstimateError::Numeric("value not representable"))
}

// `Decimal` operators panic on overflow, so everything below goes through
// the checked forms.

fn add(a: Decimal, b: Decimal) -> Result<Decimal, EstimateError> {
    a.checked_add(b).ok_or(EstimateError::Numeric("addition overflow"))
}

fn sub(a: Decimal, b: Decimal) -> Result<Decimal, EstimateError> {
    a.checked_sub(b).ok_or(EstimateError::Numeric("subtraction overflow"))
}

fn mul(a: Decimal, b: Decimal) -> Result<Decimal, EstimateError> {
    a.checked_mul(b).ok_or(EstimateError::Numeric("multiplication overflow"))
}

fn div(a: Decimal, b: Decimal) -> Result<Decimal, EstimateError> {
    a.checked_div(b).ok_or(EstimateError::Numeric("division overflow"))
}

fn sin(x: Decimal) -> Result<Decimal, EstimateError> {
    x.checked_sin().ok_or(EstimateError::Numeric("sine overflow"))
}

fn cos(x: Decimal) -> Result<Decimal, EstimateError> {
    x.checked_cos().ok_or(EstimateError::Numeric("cosine overflow"))
}

fn radians(deg: Decimal) -> Result<Decimal, EstimateError> {
    div(mul(deg, Decimal::PI)?, Decimal::from(180))
}

/// Arcsine on `[0, 1]` by Newton iteration on `sin(y) - s`.
fn asin(s: Decimal) -> Result<Decimal, EstimateError> {
    if s.is_sign_negative() || s > Decimal::ONE {
        return Err(EstimateError::Numeric("asin argument out of range"));
    }
    let mut y = s;
    for _ in 0..ASIN_MAX_ITERATIONS {
        let c = cos(y)?;
        if c.is_zero() {
            break;
        }
        let step = div(sub(sin(y)?, s)?, c)?;
        y = sub(y, step)?;
        if step.abs() < asin_tolerance() {
            break;
        }
    }
    Ok(y)
}

/// Haversine distance in metres between two (longitude, latitude) pairs in
/// degrees.
fn haversine(
    lon: Decimal,
    lat: Decimal,
    lon_i: Decimal,
    lat_i: Decimal,
) -> Result<Decimal, EstimateError> {
    let (l, p) = (radians(lon)?, radians(lat)?);
    let (li, pi) = (radians(lon_i)?, radians(lat_i)?);
    let two = Decimal::TWO;

    let sin_dp = sin(div(sub(p, pi)?, two)?)?;
    let sin_dl = sin(div(sub(l, li)?, two)?)?;
    let cross = mul(mul(cos(p)?, cos(pi)?)?, mul(sin_dl, sin_dl)?)?;
    let h = add(mul(sin_dp, sin_dp)?, cross)?;
    // Rounding can push h a hair outside [0, 1].
    let h = h.clamp(Decimal::ZERO, Decimal::ONE);

    let root = h
        .sqrt()
        .ok_or(EstimateError::Numeric("negative haversine term"))?;
    mul(mul(earth_radius(), two)?, asin(root)?)
}

/// Great-circle distance in metres on the estimator's sphere.
pub fn great_circle_distance(
    lon: f64,
    lat: f64,
    lon_i: f64,
    lat_i: f64,
) -> Result<f64, EstimateError> {
    let d = haversine(
        to_decimal(lon)?,
        to_decimal(lat)?,
        to_decimal(lon_i)?,
        to_decimal(lat_i)?,
    )?;
    d.to_f64().ok_or(EstimateError::Numeric("distance not representable"))
}

fn residuals(lon: Decimal, lat: Decimal, pts: &[Point]) -> Result<Vec<Decimal>, EstimateError> {
    pts.iter()
        .map(|p| sub(p.d, haversine(lon, lat, p.lon, p.lat)?))
        .collect()
}

/// Rows of d(model distance)/d(lon, lat) by forward differences.
fn jacobian(
    lon: Decimal,
    lat: Decimal,
    pts: &[Point],
    base: &[Decimal],
) -> Result<Vec<[Decimal; 2]>, EstimateError> {
    let eps = jacobian_step();
    let res_lon = residuals(add(lon, eps)?, lat, pts)?;
    let res_lat = residuals(lon, add(lat, eps)?, pts)?;

    base.iter()
        .zip(res_lon.iter().zip(res_lat.iter()))
        .map(|(b, (rl, rp))| {
            let d_lon = -div(sub(*rl, *b)?, eps)?;
            let d_lat = -div(sub(*rp, *b)?, eps)?;
            Ok([d_lon, d_lat])
        })
        .collect()
}

fn rms(lon: Decimal, lat: Decimal, pts: &[Point]) -> Result<Decimal, EstimateError> {
    let sum = residuals(lon, lat, pts)?
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, r| add(acc, mul(r, r)?))?;
    div(sum, Decimal::from(pts.len()))?
        .sqrt()
        .ok_or(EstimateError::Numeric("negative mean square"))
}

/// One Gauss-Newton step `(JᵀJ)⁻¹ Jᵀr`, or `None` when `JᵀJ` is singular.
fn normal_step(j: &[[Decimal; 2]], r: &[Decimal]) -> Result<Option<[Decimal; 2]>, EstimateError> {
    let (mut a00, mut a01, mut a11) = (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
    let (mut b0, mut b1) = (Decimal::ZERO, Decimal::ZERO);

    for (row, ri) in j.iter().zip(r) {
        a00 = add(a00, mul(row[0], row[0])?)?;
        a01 = add(a01, mul(row[0], row[1])?)?;
        a11 = add(a11, mul(row[1], row[1])?)?;
        b0 = add(b0, mul(row[0], *ri)?)?;
        b1 = add(b1, mul(row[1], *ri)?)?;
    }

    let diag = mul(a00, a11)?;
    let det = sub(diag, mul(a01, a01)?)?;
    // Relative test: identical rows leave only rounding noise in `det`.
    if det.abs() <= mul(diag, singular_tolerance())? {
        return Ok(None);
    }

    let d_lon = sub(mul(a11, b0)?, mul(a01, b1)?)?;
    let d_lat = sub(mul(a00, b1)?, mul(a01, b0)?)?;
    // A quotient that does not fit means the determinant is effectively zero.
    match (d_lon.checked_div(det), d_lat.checked_div(det)) {
        (Some(d_lon), Some(d_lat)) => Ok(Some([d_lon, d_lat])),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Estimate the coordinate whose great-circle distances best match the
/// observations.
///
/// Observations with a non-finite or non-positive distance are ignored.
/// Iteration starts at the centroid of the observation coordinates and runs
/// at most 30 Gauss-Newton steps, stopping early once both step components
/// drop below 1e-14 degrees.
pub fn estimate(observations: &[DistanceObservation]) -> Result<Estimate, EstimateError> {
    let usable: Vec<&DistanceObservation> =
        observations.iter().filter(|o| o.is_usable()).collect();
    if usable.len() < MIN_OBSERVATIONS {
        return Err(EstimateError::InsufficientObservations {
            usable: usable.len(),
        });
    }

    let pts = usable
        .iter()
        .map(|o| {
            Ok(Point {
                lon: to_decimal(o.longitude)?,
                lat: to_decimal(o.latitude)?,
                d: to_decimal(o.distance)?,
            })
        })
        .collect::<Result<Vec<_>, EstimateError>>()?;

    let n = Decimal::from(pts.len());
    let mut lon = div(pts.iter().try_fold(Decimal::ZERO, |acc, p| add(acc, p.lon))?, n)?;
    let mut lat = div(pts.iter().try_fold(Decimal::ZERO, |acc, p| add(acc, p.lat))?, n)?;

    let threshold = convergence_threshold();
    let mut iterations = 0;
    let mut degenerate = false;

    while iterations < MAX_ITERATIONS {
        let r = residuals(lon, lat, &pts)?;
        let j = jacobian(lon, lat, &pts, &r)?;
        let Some([d_lon, d_lat]) = normal_step(&j, &r)? else {
            degenerate = true;
            tracing::debug!(iterations, "normal equations singular, keeping current iterate");
            break;
        };

        lon = add(lon, d_lon)?;
        lat = add(lat, d_lat)?;
        iterations += 1;
        tracing::trace!(iterations, %lon, %lat, "gauss-newton step");

        if d_lon.abs() < threshold && d_lat.abs() < threshold {
            break;
        }
    }

    let rms = rms(lon, lat, &pts)?;
    Ok(Estimate {
        longitude: lon
            .to_f64()
            .ok_or(EstimateError::Numeric("longitude not representable"))?,
        latitude: lat
            .to_f64()
            .ok_or(EstimateError::Numeric("latitude not representable"))?,
        rms: rms.to_f64().unwrap_or(f64::NAN),
        iterations,
        used: pts.len(),
        degenerate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asin_inverts_sin() {
        let x = Decimal::new(5, 1);
        let y = asin(sin(x).unwrap()).unwrap();
        assert!((y - x).abs() < Decimal::new(1, 20));
    }

    #[test]
    fn distance_between_neighbouring_buildings() {
        // ZJGD1 to ZJGX1 is roughly 400 m apart.
        let d = great_circle_distance(120.089136, 30.302331, 120.085042, 30.30173).unwrap();
        assert!((350.0..450.0).contains(&d), "got {d}");
        let zero = great_circle_distance(120.0, 30.0, 120.0, 30.0).unwrap();
        assert!(zero.abs() < 1e-9);
    }

    #[test]
    fn too_few_usable_observations() {
        let obs = [
            DistanceObservation::new(120.08, 30.30, 100.0),
            DistanceObservation::new(120.09, 30.30, 0.0),
            DistanceObservation::new(120.10, 30.31, f64::NAN),
            DistanceObservation::new(120.11, 30.32, 250.0),
        ];
        assert_eq!(
            estimate(&obs),
            Err(EstimateError::InsufficientObservations { usable: 2 })
        );
    }

    #[test]
    fn coincident_beacons_are_degenerate() {
        let obs = [
            DistanceObservation::new(120.08, 30.30, 100.0),
            DistanceObservation::new(120.08, 30.30, 100.0),
            DistanceObservation::new(120.08, 30.30, 100.0),
        ];
        let est = estimate(&obs).unwrap();
        assert!(est.degenerate);
    }
}
