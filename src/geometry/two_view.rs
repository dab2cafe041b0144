//! Two-view geometry: homography / essential model selection, motion
//! recovery and linear triangulation.
//!
//! Both models are fitted by RANSAC on the same eight-point samples and
//! scored with a chi-square truncated transfer error in both images. When
//! the homography explains the matches at least as well (planar or
//! low-relief scenes), it is decomposed into eight candidate motions;
//! otherwise the essential matrix gives four. The candidate that
//! triangulates the most points in front of both cameras wins, provided no
//! other candidate comes close.
//!
//! All inputs are normalized image coordinates (z = 1 plane). Poses passed
//! to the triangulation helpers are world-to-camera (T_cw).

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::geometry::SE3;

/// Chi-square bounds at 95% for one and two degrees of freedom.
const CHI2_1DOF: f64 = 3.841;
const CHI2_2DOF: f64 = 5.991;

/// Homography share of the combined score above which the homography is
/// reconstructed.
const HOMOGRAPHY_RATIO: f64 = 0.40;

/// Share of the model inliers the chosen motion must triangulate.
const MIN_GOOD_RATIO: f64 = 0.8;

/// A runner-up motion with this share of the best one's points makes the
/// reconstruction ambiguous.
const AMBIGUITY_RATIO: f64 = 0.75;

/// Model that explained the correspondences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoViewModel {
    Homography,
    Essential,
}

/// Relative pose and structure recovered from two views.
#[derive(Debug, Clone)]
pub struct TwoViewResult {
    /// Pose of camera 2 relative to camera 1 (T_c2c1), unit-norm translation.
    pub pose_21: SE3,
    /// Correspondences consistent with the model and triangulated in front
    /// of both cameras.
    pub inliers: Vec<bool>,
    /// Triangulated points in camera-1 coordinates, `None` for rejected ones.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Median parallax of the triangulated points, degrees.
    pub median_parallax_deg: f64,
    pub model: TwoViewModel,
}

/// RANSAC parameters for two-view reconstruction.
#[derive(Debug, Clone, Copy)]
pub struct TwoViewParams {
    pub iterations: usize,
    /// Inlier bound on the point-to-epipolar-line distance in normalized
    /// units (pixels / focal). The homography bound is derived from it.
    pub threshold: f64,
    pub seed: u64,
}

/// Estimate the relative pose of two views.
///
/// Returns `None` with fewer than 8 correspondences, when neither model
/// finds support, or when no candidate motion triangulates enough points
/// unambiguously.
pub fn estimate_relative_pose(
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    params: &TwoViewParams,
) -> Option<TwoViewResult> {
    let n = x1.len();
    if n < 8 || x2.len() != n {
        return None;
    }
    // Per-coordinate noise such that the line-distance bound is chi2(1).
    let sigma2 = params.threshold * params.threshold / CHI2_1DOF;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_h: Option<Scored> = None;
    let mut best_e: Option<Scored> = None;
    for _ in 0..params.iterations {
        let idx = sample(&mut rng, n, 8).into_vec();
        let s1: Vec<_> = idx.iter().map(|&i| x1[i]).collect();
        let s2: Vec<_> = idx.iter().map(|&i| x2[i]).collect();
        if let Some(h) = homography_dlt(&s1, &s2) {
            keep_best(&mut best_h, score_homography(&h, x1, x2, sigma2));
        }
        if let Some(e) = eight_point(&s1, &s2) {
            keep_best(&mut best_e, score_essential(&e, x1, x2, sigma2));
        }
    }
    let best_h = best_h.map(|s| refit(s, x1, x2, sigma2, homography_dlt, score_homography));
    let best_e = best_e.map(|s| refit(s, x1, x2, sigma2, eight_point, score_essential));

    let score_h = best_h.as_ref().map_or(0.0, |s| s.score);
    let score_e = best_e.as_ref().map_or(0.0, |s| s.score);
    if score_h + score_e <= 0.0 {
        return None;
    }
    if score_h / (score_h + score_e) > HOMOGRAPHY_RATIO {
        let h = best_h?;
        reconstruct_from_homography(&h.model, x1, x2, &h.inliers, sigma2)
    } else {
        let e = best_e?;
        reconstruct_from_essential(&e.model, x1, x2, &e.inliers, sigma2)
    }
}

/// A model hypothesis with its score and inlier mask.
struct Scored {
    model: Matrix3<f64>,
    score: f64,
    inliers: Vec<bool>,
}

fn keep_best(best: &mut Option<Scored>, candidate: Scored) {
    if best.as_ref().map_or(true, |b| candidate.score > b.score) {
        *best = Some(candidate);
    }
}

type Fit = fn(&[Vector2<f64>], &[Vector2<f64>]) -> Option<Matrix3<f64>>;
type Score = fn(&Matrix3<f64>, &[Vector2<f64>], &[Vector2<f64>], f64) -> Scored;

/// Re-estimate from every inlier; keep the refit only if it scores higher.
fn refit(scored: Scored, x1: &[Vector2<f64>], x2: &[Vector2<f64>], sigma2: f64, fit: Fit, score: Score) -> Scored {
    let in1: Vec<_> = x1.iter().zip(&scored.inliers).filter(|(_, &ok)| ok).map(|(p, _)| *p).collect();
    let in2: Vec<_> = x2.iter().zip(&scored.inliers).filter(|(_, &ok)| ok).map(|(p, _)| *p).collect();
    match fit(&in1, &in2).map(|m| score(&m, x1, x2, sigma2)) {
        Some(rescored) if rescored.score >= scored.score => rescored,
        _ => scored,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model fitting
// ─────────────────────────────────────────────────────────────────────────────

/// Translate points to their centroid and scale the mean absolute
/// deviation to one per axis. Returns the points and the transform.
fn normalize_points(pts: &[Vector2<f64>]) -> Option<(Vec<Vector2<f64>>, Matrix3<f64>)> {
    let n = pts.len() as f64;
    let mean = pts.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p) / n;
    let dev = pts
        .iter()
        .fold(Vector2::<f64>::zeros(), |acc, p| acc + (p - mean).abs())
        / n;
    if dev.x <= f64::EPSILON || dev.y <= f64::EPSILON {
        return None;
    }
    let (sx, sy) = (1.0 / dev.x, 1.0 / dev.y);
    let normalized = pts
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    Some((normalized, t))
}

/// Eigenvector of the smallest eigenvalue of a symmetric 9x9 matrix, as a
/// row-major 3x3 matrix.
fn null_vector(ata: &SMatrix<f64, 9, 9>) -> Option<Matrix3<f64>> {
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v = eig.eigenvectors.column(min_idx);
    Some(Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]))
}

/// SVD with singular values in decreasing order.
fn sorted_svd(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&i, &j| svd.singular_values[j].total_cmp(&svd.singular_values[i]));
    let mut su = Matrix3::zeros();
    let mut sv_t = Matrix3::zeros();
    let mut w = Vector3::zeros();
    for (k, &i) in order.iter().enumerate() {
        su.set_column(k, &u.column(i));
        sv_t.set_row(k, &v_t.row(i));
        w[k] = svd.singular_values[i];
    }
    Some((su, w, sv_t))
}

/// Normalized DLT homography with x2 ~ H x1, from at least four points.
pub fn homography_dlt(x1: &[Vector2<f64>], x2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    if x1.len() < 4 || x1.len() != x2.len() {
        return None;
    }
    let (n1, t1) = normalize_points(x1)?;
    let (n2, t2) = normalize_points(x2)?;
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in n1.iter().zip(&n2) {
        let rx = SMatrix::<f64, 1, 9>::from_row_slice(&[
            a.x, a.y, 1.0,
            0.0, 0.0, 0.0,
            -b.x * a.x, -b.x * a.y, -b.x,
        ]);
        let ry = SMatrix::<f64, 1, 9>::from_row_slice(&[
            0.0, 0.0, 0.0,
            a.x, a.y, 1.0,
            -b.y * a.x, -b.y * a.y, -b.y,
        ]);
        ata += rx.transpose() * rx + ry.transpose() * ry;
    }
    let hn = null_vector(&ata)?;
    Some(t2.try_inverse()? * hn * t1)
}

/// Normalized eight-point algorithm (Hartley), projected onto the
/// essential manifold.
pub fn eight_point(x1: &[Vector2<f64>], x2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    if x1.len() < 8 || x1.len() != x2.len() {
        return None;
    }
    let (n1, t1) = normalize_points(x1)?;
    let (n2, t2) = normalize_points(x2)?;
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in n1.iter().zip(&n2) {
        let row = SMatrix::<f64, 1, 9>::from_row_slice(&[
            b.x * a.x, b.x * a.y, b.x,
            b.y * a.x, b.y * a.y, b.y,
            a.x, a.y, 1.0,
        ]);
        ata += row.transpose() * row;
    }
    let fn_ = null_vector(&ata)?;

    // Rank 2 in the normalized frame, then undo the normalization.
    let (u, w, v_t) = sorted_svd(&fn_)?;
    let fn_ = u * Matrix3::from_diagonal(&Vector3::new(w[0], w[1], 0.0)) * v_t;
    let e = t2.transpose() * fn_ * t1;

    // Essential manifold: singular values (1, 1, 0).
    let (u, _, v_t) = sorted_svd(&e)?;
    Some(u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────────────────────────

/// Squared distance between `to` and `from` mapped through `h`.
fn transfer_sq(h: &Matrix3<f64>, from: &Vector2<f64>, to: &Vector2<f64>) -> f64 {
    let p = h * Vector3::new(from.x, from.y, 1.0);
    if p.z.abs() <= f64::EPSILON {
        return f64::INFINITY;
    }
    (Vector2::new(p.x / p.z, p.y / p.z) - to).norm_squared()
}

/// Symmetric transfer error, each image bounded by chi2(2).
fn score_homography(h: &Matrix3<f64>, x1: &[Vector2<f64>], x2: &[Vector2<f64>], sigma2: f64) -> Scored {
    let n = x1.len();
    let mut scored = Scored {
        model: *h,
        score: 0.0,
        inliers: vec![false; n],
    };
    let Some(h_inv) = h.try_inverse() else {
        return scored;
    };
    for i in 0..n {
        let mut inlier = true;
        for chi2 in [transfer_sq(h, &x1[i], &x2[i]) / sigma2, transfer_sq(&h_inv, &x2[i], &x1[i]) / sigma2] {
            if chi2 < CHI2_2DOF {
                scored.score += CHI2_2DOF - chi2;
            } else {
                inlier = false;
            }
        }
        scored.inliers[i] = inlier;
    }
    scored
}

/// Point-to-epipolar-line distance in both images, bounded by chi2(1) and
/// scored against chi2(2) so both models share a scale.
fn score_essential(e: &Matrix3<f64>, x1: &[Vector2<f64>], x2: &[Vector2<f64>], sigma2: f64) -> Scored {
    let n = x1.len();
    let mut scored = Scored {
        model: *e,
        score: 0.0,
        inliers: vec![false; n],
    };
    for i in 0..n {
        let p1 = Vector3::new(x1[i].x, x1[i].y, 1.0);
        let p2 = Vector3::new(x2[i].x, x2[i].y, 1.0);
        let l2 = e * p1;
        let l1 = e.transpose() * p2;
        let num = p2.dot(&l2);
        let mut inlier = true;
        for line in [l2, l1] {
            let den = line.x * line.x + line.y * line.y;
            let chi2 = if den > f64::EPSILON { num * num / den / sigma2 } else { f64::INFINITY };
            if chi2 < CHI2_1DOF {
                scored.score += CHI2_2DOF - chi2;
            } else {
                inlier = false;
            }
        }
        scored.inliers[i] = inlier;
    }
    scored
}

/// Squared Sampson distance of a correspondence to x2ᵀ E x1 = 0.
pub fn sampson_sq(e: &Matrix3<f64>, x1: &Vector2<f64>, x2: &Vector2<f64>) -> f64 {
    let p1 = Vector3::new(x1.x, x1.y, 1.0);
    let p2 = Vector3::new(x2.x, x2.y, 1.0);
    let ex1 = e * p1;
    let etx2 = e.transpose() * p2;
    let num = p2.dot(&ex1);
    let den = ex1.x * ex1.x + ex1.y * ex1.y + etx2.x * etx2.x + etx2.y * etx2.y;
    if den <= f64::EPSILON {
        return f64::INFINITY;
    }
    num * num / den
}

// ─────────────────────────────────────────────────────────────────────────────
// Motion recovery
// ─────────────────────────────────────────────────────────────────────────────

/// The four (R, t) factorizations of an essential matrix.
fn reconstruct_from_essential(
    e: &Matrix3<f64>,
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    inliers: &[bool],
    sigma2: f64,
) -> Option<TwoViewResult> {
    let (mut u, _, mut v_t) = sorted_svd(e)?;
    // The null direction is last, so flipping it leaves E unchanged.
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let t: Vector3<f64> = u.column(2).into_owned();
    let motions = [
        (u * w * v_t, t),
        (u * w * v_t, -t),
        (u * w.transpose() * v_t, t),
        (u * w.transpose() * v_t, -t),
    ];
    select_motion(&motions, x1, x2, inliers, sigma2, TwoViewModel::Essential)
}

/// Faugeras' decomposition of a calibrated homography into eight motions.
fn reconstruct_from_homography(
    h: &Matrix3<f64>,
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    inliers: &[bool],
    sigma2: f64,
) -> Option<TwoViewResult> {
    let (u, d, v_t) = sorted_svd(h)?;
    let s = u.determinant() * v_t.determinant();
    let (d1, d2, d3) = (d[0], d[1], d[2]);
    // Pure rotation or a degenerate fit.
    if d2 <= f64::EPSILON || d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
        return None;
    }

    let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
    let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
    let x1s = [aux1, aux1, -aux1, -aux1];
    let x3s = [aux3, -aux3, aux3, -aux3];
    let mut motions = Vec::with_capacity(8);

    // d' = d2
    let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
    let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
    let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
    for i in 0..4 {
        let rp = Matrix3::new(ctheta, 0.0, -stheta[i], 0.0, 1.0, 0.0, stheta[i], 0.0, ctheta);
        let tp = Vector3::new(x1s[i], 0.0, -x3s[i]) * (d1 - d3);
        motions.push((u * rp * v_t * s, (u * tp).normalize()));
    }

    // d' = -d2
    let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
    let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
    let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
    for i in 0..4 {
        let rp = Matrix3::new(cphi, 0.0, sphi[i], 0.0, -1.0, 0.0, sphi[i], 0.0, -cphi);
        let tp = Vector3::new(x1s[i], 0.0, x3s[i]) * (d1 + d3);
        motions.push((u * rp * v_t * s, (u * tp).normalize()));
    }
    select_motion(&motions, x1, x2, inliers, sigma2, TwoViewModel::Homography)
}

/// Keep the candidate motion that triangulates the most points, rejecting
/// the reconstruction when it is weakly supported or ambiguous.
fn select_motion(
    motions: &[(Matrix3<f64>, Vector3<f64>)],
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    inliers: &[bool],
    sigma2: f64,
    model: TwoViewModel,
) -> Option<TwoViewResult> {
    let num_inliers = inliers.iter().filter(|&&b| b).count();
    let mut best: Option<(usize, TwoViewResult)> = None;
    let mut second = 0usize;
    for (r, t) in motions {
        if !r.iter().chain(t.iter()).all(|v| v.is_finite()) {
            continue;
        }
        let Some((good, result)) = check_motion(SE3::from_rt(r, *t), x1, x2, inliers, sigma2, model) else {
            continue;
        };
        match &best {
            Some((b, _)) if good <= *b => second = second.max(good),
            _ => {
                second = best.as_ref().map_or(second, |(b, _)| second.max(*b));
                best = Some((good, result));
            }
        }
    }
    let (good, result) = best?;
    if (good as f64) < MIN_GOOD_RATIO * num_inliers as f64 || second as f64 > AMBIGUITY_RATIO * good as f64 {
        return None;
    }
    Some(result)
}

/// Triangulate the inliers under one motion. A point counts when it lies
/// in front of both cameras and reprojects within 2 sigma in each image.
fn check_motion(
    pose_21: SE3,
    x1: &[Vector2<f64>],
    x2: &[Vector2<f64>],
    inliers: &[bool],
    sigma2: f64,
    model: TwoViewModel,
) -> Option<(usize, TwoViewResult)> {
    let th2 = 4.0 * sigma2;
    let cam1 = SE3::identity();
    let center2 = pose_21.inverse().translation;
    let mut points = vec![None; x1.len()];
    let mut good = vec![false; x1.len()];
    let mut parallaxes = Vec::new();
    for i in 0..x1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p) = triangulate_dlt(&cam1, &pose_21, &x1[i], &x2[i]) else {
            continue;
        };
        let p2 = pose_21.transform_point(&p);
        if p.z <= 0.0 || p2.z <= 0.0 {
            continue;
        }
        let e1 = (Vector2::new(p.x / p.z, p.y / p.z) - x1[i]).norm_squared();
        let e2 = (Vector2::new(p2.x / p2.z, p2.y / p2.z) - x2[i]).norm_squared();
        if e1 > th2 || e2 > th2 {
            continue;
        }
        good[i] = true;
        parallaxes.push(parallax_deg(&Vector3::zeros(), &center2, &p));
        points[i] = Some(p);
    }
    if parallaxes.is_empty() {
        return None;
    }
    parallaxes.sort_by(|a, b| a.total_cmp(b));
    let median_parallax_deg = parallaxes[parallaxes.len() / 2];
    Some((
        parallaxes.len(),
        TwoViewResult {
            pose_21,
            inliers: good,
            points,
            median_parallax_deg,
            model,
        },
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Triangulation
// ─────────────────────────────────────────────────────────────────────────────

/// Linear (DLT) triangulation of one correspondence.
///
/// `pose1` and `pose2` map world points into each camera (T_cw); `x1`, `x2`
/// are normalized coordinates. Returns the world point, or `None` when the
/// solution lies at infinity.
pub fn triangulate_dlt(
    pose1: &SE3,
    pose2: &SE3,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let p1 = pose1.to_matrix();
    let p2 = pose2.to_matrix();
    let mut a = Matrix4::zeros();
    a.set_row(0, &(x1.x * p1.row(2) - p1.row(0)));
    a.set_row(1, &(x1.y * p1.row(2) - p1.row(1)));
    a.set_row(2, &(x2.x * p2.row(2) - p2.row(0)));
    a.set_row(3, &(x2.y * p2.row(2) - p2.row(1)));

    let eig = (a.transpose() * a).symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.total_cmp(r.1))?;
    let h = eig.eigenvectors.column(min_idx);
    if h[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    if p.iter().all(|v| v.is_finite()) {
        Some(p)
    } else {
        None
    }
}

/// Angle (degrees) between the rays from two camera centres to a point.
pub fn parallax_deg(center1: &Vector3<f64>, center2: &Vector3<f64>, point: &Vector3<f64>) -> f64 {
    let r1 = point - center1;
    let r2 = point - center2;
    let denom = r1.norm() * r2.norm();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (r1.dot(&r2) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn scene() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                let x = -1.0 + 0.4 * i as f64;
                let y = -0.8 + 0.3 * j as f64;
                let z = 4.0 + 0.5 * ((i * 7 + j * 3) % 5) as f64;
                pts.push(Vector3::new(x, y, z));
            }
        }
        pts
    }

    /// Points on a wall facing the first camera at 2.5 m.
    fn wall() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..8 {
            for j in 0..6 {
                let x = -1.2 + 0.33 * i as f64 + 0.01 * ((i * j) % 3) as f64;
                let y = -0.9 + 0.35 * j as f64;
                pts.push(Vector3::new(x, y, 2.5));
            }
        }
        pts
    }

    fn project(pose_cw: &SE3, p: &Vector3<f64>) -> Vector2<f64> {
        let c = pose_cw.transform_point(p);
        Vector2::new(c.x / c.z, c.y / c.z)
    }

    fn params(iterations: usize) -> TwoViewParams {
        TwoViewParams {
            iterations,
            threshold: 1e-3,
            seed: 1,
        }
    }

    #[test]
    fn test_recovers_relative_pose_up_to_scale() {
        let pose_21 = SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            Vector3::new(-0.5, 0.05, 0.02),
        );
        let pts = scene();
        let x1: Vec<_> = pts.iter().map(|p| project(&SE3::identity(), p)).collect();
        let x2: Vec<_> = pts.iter().map(|p| project(&pose_21, p)).collect();
        let result = estimate_relative_pose(&x1, &x2, &params(100)).unwrap();
        assert_eq!(result.model, TwoViewModel::Essential);
        assert_eq!(result.inliers.iter().filter(|&&b| b).count(), pts.len());
        assert_relative_eq!(
            result.pose_21.rotation.angle_to(&pose_21.rotation),
            0.0,
            epsilon = 1e-6
        );
        let t_dir = pose_21.translation.normalize();
        assert_relative_eq!(result.pose_21.translation.dot(&t_dir), 1.0, epsilon = 1e-6);
        assert!(result.median_parallax_deg > 1.0);
    }

    #[test]
    fn test_planar_scene_selects_homography() {
        // Second camera 10 cm to the right of the first, same orientation.
        let pose_21 = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.1, 0.0, 0.0));
        let pts = wall();
        let x1: Vec<_> = pts.iter().map(|p| project(&SE3::identity(), p)).collect();
        let x2: Vec<_> = pts.iter().map(|p| project(&pose_21, p)).collect();
        let result = estimate_relative_pose(&x1, &x2, &params(200)).unwrap();
        assert_eq!(result.model, TwoViewModel::Homography);
        assert!(result.pose_21.rotation.angle() < 1e-6);
        assert_relative_eq!(result.pose_21.translation.dot(&-Vector3::x()), 1.0, epsilon = 1e-6);
        assert_eq!(result.inliers.iter().filter(|&&b| b).count(), pts.len());

        // Depths agree with the wall up to the unit baseline scale.
        let scale = 2.5 / result.points[0].unwrap().z;
        for p in result.points.iter().flatten() {
            assert_relative_eq!(p.z * scale, 2.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_homography_dlt_maps_points() {
        let h = Matrix3::new(1.02, 0.01, -0.04, -0.02, 0.98, 0.01, 0.001, 0.002, 1.0);
        let x1: Vec<Vector2<f64>> = (0..8)
            .map(|i| Vector2::new(-0.4 + 0.12 * i as f64, 0.3 * (1.3 * i as f64).sin()))
            .collect();
        let x2: Vec<Vector2<f64>> = x1
            .iter()
            .map(|p| {
                let q = h * Vector3::new(p.x, p.y, 1.0);
                Vector2::new(q.x / q.z, q.y / q.z)
            })
            .collect();
        let est = homography_dlt(&x1, &x2).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(transfer_sq(&est, a, b) < 1e-18);
        }
    }

    #[test]
    fn test_eight_point_satisfies_epipolar_constraint() {
        let pose_21 = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0), Vector3::new(-0.3, 0.0, 0.05));
        let pts = scene();
        let x1: Vec<_> = pts.iter().map(|p| project(&SE3::identity(), p)).collect();
        let x2: Vec<_> = pts.iter().map(|p| project(&pose_21, p)).collect();
        let e = eight_point(&x1, &x2).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(sampson_sq(&e, a, b) < 1e-18);
        }
        let (_, w, _) = sorted_svd(&e).unwrap();
        assert_relative_eq!(w[0], w[1], epsilon = 1e-9);
        assert!(w[2].abs() < 1e-9);
    }

    #[test]
    fn test_triangulate_dlt_exact() {
        let pose2 = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.3, 0.0, 0.0));
        let p = Vector3::new(0.2, -0.1, 3.0);
        let x1 = project(&SE3::identity(), &p);
        let x2 = project(&pose2, &p);
        let q = triangulate_dlt(&SE3::identity(), &pose2, &x1, &x2).unwrap();
        assert_relative_eq!(q, p, epsilon = 1e-9);
    }

    #[test]
    fn test_parallax_deg() {
        let p = Vector3::new(0.0, 0.0, 1.0);
        let deg = parallax_deg(&Vector3::new(-1.0, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0), &p);
        assert_relative_eq!(deg, 90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_too_few_points() {
        let x = vec![Vector2::zeros(); 5];
        assert!(estimate_relative_pose(&x, &x, &params(10)).is_none());
    }
}
