//! PnP (Perspective-n-Point): P3P minimal solver inside RANSAC, followed by
//! robust Gauss-Newton refinement of the reprojection error.

use nalgebra::{Complex, Matrix3, Matrix6, Vector2, Vector3, Vector6};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::geometry::so3::{project_to_so3, skew};
use crate::geometry::SE3;
use crate::tracking::frame::CalibratedCamera;

/// RANSAC and refinement parameters.
#[derive(Debug, Clone, Copy)]
pub struct PnpParams {
    pub max_iterations: usize,
    /// Inlier threshold on the reprojection error, pixels.
    pub reproj_threshold_px: f64,
    /// Stop early once this probability of an outlier-free sample is reached.
    pub confidence: f64,
    pub refine_iterations: usize,
    pub seed: u64,
}

impl Default for PnpParams {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            reproj_threshold_px: 5.991_f64.sqrt() * 1.5,
            confidence: 0.99,
            refine_iterations: 10,
            seed: 0,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnpResult {
    /// Estimated camera pose (T_wc).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    /// Reprojection error per correspondence (in pixels).
    pub reproj_errors: Vec<f64>,
}

impl PnpResult {
    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&b| b).count()
    }
}

/// Solve PnP with RANSAC given 3D-2D correspondences.
///
/// `points2d` are undistorted pixels. Returns `None` with fewer than four
/// correspondences or when no hypothesis has at least four inliers.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CalibratedCamera,
    params: &PnpParams,
) -> Option<PnpResult> {
    let n = points3d.len();
    if n < 4 || points2d.len() != n {
        return None;
    }
    let bearings: Vec<Vector3<f64>> = points2d.iter().map(|p| camera.bearing(p.x, p.y)).collect();

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_pose: Option<SE3> = None;
    let mut best_count = 0usize;
    let mut max_iter = params.max_iterations;
    let mut iter = 0;

    while iter < max_iter {
        iter += 1;
        let idx = sample(&mut rng, n, 4).into_vec();
        let world = [points3d[idx[0]], points3d[idx[1]], points3d[idx[2]]];
        let rays = [bearings[idx[0]], bearings[idx[1]], bearings[idx[2]]];

        // The fourth point disambiguates the P3P solutions.
        let check = idx[3];
        let Some(pose_cw) = p3p(&world, &rays)
            .into_iter()
            .filter_map(|pose| {
                reprojection_error(&pose, camera, &points3d[check], &points2d[check])
                    .map(|err| (pose, err))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(pose, _)| pose)
        else {
            continue;
        };

        let count = count_inliers(&pose_cw, camera, points3d, points2d, params.reproj_threshold_px);
        if count > best_count {
            best_count = count;
            best_pose = Some(pose_cw);
            let w = count as f64 / n as f64;
            let denom = (1.0 - w.powi(3)).ln();
            if denom < 0.0 {
                let needed = ((1.0 - params.confidence).ln() / denom).ceil();
                if needed.is_finite() && needed >= 0.0 {
                    max_iter = max_iter.min(needed as usize + 1);
                }
            }
        }
    }

    if best_count < 4 {
        return None;
    }
    let pose_cw = best_pose?;
    let refined = refine_pose_cw(&pose_cw, points3d, points2d, &[], camera, params);
    let result = evaluate(&refined, points3d, points2d, camera, params.reproj_threshold_px);
    if result.num_inliers() < 4 {
        return None;
    }
    Some(result)
}

/// Refine a pose prior (T_wc) against correspondences without RANSAC.
///
/// Used when a motion model already provides a good initial guess.
pub fn refine_pose(
    initial_twc: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CalibratedCamera,
    params: &PnpParams,
) -> PnpResult {
    refine_pose_weighted(initial_twc, points3d, points2d, &[], camera, params)
}

/// [`refine_pose`] with a per-correspondence information weight, typically
/// the inverse variance of the keypoint's pyramid level. An empty slice
/// weighs every correspondence equally.
pub fn refine_pose_weighted(
    initial_twc: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    weights: &[f64],
    camera: &CalibratedCamera,
    params: &PnpParams,
) -> PnpResult {
    let pose_cw = refine_pose_cw(&initial_twc.inverse(), points3d, points2d, weights, camera, params);
    evaluate(&pose_cw, points3d, points2d, camera, params.reproj_threshold_px)
}

fn evaluate(
    pose_cw: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CalibratedCamera,
    threshold: f64,
) -> PnpResult {
    let reproj_errors: Vec<f64> = points3d
        .iter()
        .zip(points2d)
        .map(|(p, uv)| reprojection_error(pose_cw, camera, p, uv).unwrap_or(f64::INFINITY))
        .collect();
    let inlier_mask = reproj_errors.iter().map(|&e| e < threshold).collect();
    PnpResult {
        pose: pose_cw.inverse(),
        inlier_mask,
        reproj_errors,
    }
}

fn count_inliers(
    pose_cw: &SE3,
    camera: &CalibratedCamera,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    threshold: f64,
) -> usize {
    points3d
        .iter()
        .zip(points2d)
        .filter(|(p, uv)| {
            reprojection_error(pose_cw, camera, p, uv).map_or(false, |e| e < threshold)
        })
        .count()
}

/// Pixel reprojection error, `None` for points behind the camera.
pub fn reprojection_error(
    pose_cw: &SE3,
    camera: &CalibratedCamera,
    point: &Vector3<f64>,
    pixel: &Vector2<f64>,
) -> Option<f64> {
    let uv = camera.project(&pose_cw.transform_point(point))?;
    Some((uv - pixel).norm())
}

/// Huber-weighted Gauss-Newton on T_cw with left perturbations.
///
/// Inliers are re-selected every iteration on the weighted error; the loop
/// stops on convergence or when the normal equations become singular.
fn refine_pose_cw(
    initial: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    weights: &[f64],
    camera: &CalibratedCamera,
    params: &PnpParams,
) -> SE3 {
    let huber = params.reproj_threshold_px;
    let outlier = 2.0 * params.reproj_threshold_px;
    let mut pose = initial.clone();

    for _ in 0..params.refine_iterations {
        let mut h = Matrix6::<f64>::zeros();
        let mut g = Vector6::<f64>::zeros();
        let mut used = 0usize;

        for (i, (p, uv)) in points3d.iter().zip(points2d).enumerate() {
            let info = weights.get(i).copied().unwrap_or(1.0);
            let pc = pose.transform_point(p);
            if pc.z <= 1e-6 {
                continue;
            }
            let inv_z = 1.0 / pc.z;
            let proj = Vector2::new(
                camera.fx * pc.x * inv_z + camera.cx,
                camera.fy * pc.y * inv_z + camera.cy,
            );
            let r = proj - uv;
            let err = r.norm() * info.sqrt();
            if err > outlier {
                continue;
            }
            let w = info * if err <= huber { 1.0 } else { huber / err };

            let j_proj = nalgebra::Matrix2x3::new(
                camera.fx * inv_z, 0.0, -camera.fx * pc.x * inv_z * inv_z,
                0.0, camera.fy * inv_z, -camera.fy * pc.y * inv_z * inv_z,
            );
            // d(pc)/d[omega, v] = [-[pc]x, I]
            let mut j_point = nalgebra::Matrix3x6::<f64>::zeros();
            j_point.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(&pc)));
            j_point.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
            let j = j_proj * j_point;

            h += w * j.transpose() * j;
            g += w * j.transpose() * r;
            used += 1;
        }

        if used < 4 {
            break;
        }
        let Some(chol) = h.cholesky() else {
            break;
        };
        let delta = -chol.solve(&g);
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let v = Vector3::new(delta[3], delta[4], delta[5]);
        pose = pose.retract_left(&omega, &v);
        if delta.norm() < 1e-8 {
            break;
        }
    }
    pose
}

// ─────────────────────────────────────────────────────────────────────────────
// P3P (Grunert)
// ─────────────────────────────────────────────────────────────────────────────

/// Up to four camera poses (T_cw) consistent with three world points seen
/// along three unit bearings.
pub fn p3p(world: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Vec<SE3> {
    let a2 = (world[1] - world[2]).norm_squared();
    let b2 = (world[0] - world[2]).norm_squared();
    let c2 = (world[0] - world[1]).norm_squared();
    if a2 < 1e-12 || b2 < 1e-12 || c2 < 1e-12 {
        return Vec::new();
    }
    let cos_a = bearings[1].dot(&bearings[2]);
    let cos_b = bearings[0].dot(&bearings[2]);
    let cos_g = bearings[0].dot(&bearings[1]);

    // With s2 = u*s1 and s3 = v*s1, u is rational in v:
    // u = N(v) / D(v). Substituting into the (1,2) distance constraint
    // yields a quartic in v.
    let k = (a2 - c2) / b2;
    let n_poly = [1.0 + k, -2.0 * k * cos_b, k - 1.0];
    let d_poly = [2.0 * cos_g, -2.0 * cos_a];
    let q_poly = [1.0, -2.0 * cos_b, 1.0];

    let d2 = poly_mul(&d_poly, &d_poly);
    let n2 = poly_mul(&n_poly, &n_poly);
    let nd = poly_mul(&n_poly, &d_poly);
    let qd2 = poly_mul(&q_poly, &d2);
    let mut quartic = [0.0; 5];
    for (i, c) in quartic.iter_mut().enumerate() {
        let at = |p: &[f64]| p.get(i).copied().unwrap_or(0.0);
        *c = at(&d2) + at(&n2) - 2.0 * cos_g * at(&nd) - (c2 / b2) * at(&qd2);
    }

    let mut poses = Vec::new();
    for v in real_roots(&quartic) {
        if v <= 0.0 {
            continue;
        }
        let d = d_poly[0] + d_poly[1] * v;
        if d.abs() < 1e-12 {
            continue;
        }
        let u = (n_poly[0] + n_poly[1] * v + n_poly[2] * v * v) / d;
        if u <= 0.0 {
            continue;
        }
        let denom = 1.0 + v * v - 2.0 * v * cos_b;
        if denom <= 1e-12 {
            continue;
        }
        let s1 = (b2 / denom).sqrt();
        let cam = [bearings[0] * s1, bearings[1] * (u * s1), bearings[2] * (v * s1)];
        if let Some(pose) = align_points(world, &cam) {
            poses.push(pose);
        }
    }
    poses
}

/// Rigid transform (T_cw) mapping three world points onto camera points.
fn align_points(world: &[Vector3<f64>; 3], cam: &[Vector3<f64>; 3]) -> Option<SE3> {
    let cw = (world[0] + world[1] + world[2]) / 3.0;
    let cc = (cam[0] + cam[1] + cam[2]) / 3.0;
    let mut cov = Matrix3::zeros();
    for i in 0..3 {
        cov += (cam[i] - cc) * (world[i] - cw).transpose();
    }
    let r = project_to_so3(&cov)?;
    let t = cc - r * cw;
    Some(SE3::from_rt(&r, t))
}

fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Real roots of a polynomial given low-to-high coefficients.
///
/// Durand-Kerner iteration, then Newton polishing of the near-real roots.
fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let mut c: Vec<f64> = coeffs.to_vec();
    while c.len() > 1 && c.last().map_or(false, |v| v.abs() < 1e-12) {
        c.pop();
    }
    let degree = c.len().saturating_sub(1);
    if degree == 0 {
        return Vec::new();
    }
    let lead = c[degree];
    let monic: Vec<f64> = c.iter().map(|v| v / lead).collect();
    let eval_c = |z: Complex<f64>| {
        monic
            .iter()
            .rev()
            .fold(Complex::new(0.0, 0.0), |acc, &k| acc * z + Complex::new(k, 0.0))
    };

    let seed = Complex::new(0.4, 0.9);
    let mut roots: Vec<Complex<f64>> = (0..degree).map(|i| seed.powu(i as u32)).collect();
    for _ in 0..200 {
        let mut max_step = 0.0f64;
        for i in 0..degree {
            let mut denom = Complex::new(1.0, 0.0);
            for j in 0..degree {
                if i != j {
                    denom *= roots[i] - roots[j];
                }
            }
            if denom.norm() < 1e-300 {
                continue;
            }
            let step = eval_c(roots[i]) / denom;
            roots[i] -= step;
            max_step = max_step.max(step.norm());
        }
        if max_step < 1e-14 {
            break;
        }
    }

    let eval = |x: f64| c.iter().rev().fold(0.0, |acc, &k| acc * x + k);
    let deriv = |x: f64| {
        c.iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (i, &k)| acc * x + i as f64 * k)
    };
    roots
        .into_iter()
        .filter(|z| z.im.abs() < 1e-6 * (1.0 + z.re.abs()))
        .map(|z| {
            let mut x = z.re;
            for _ in 0..5 {
                let d = deriv(x);
                if d.abs() < 1e-15 {
                    break;
                }
                x -= eval(x) / d;
            }
            x
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CalibratedCamera {
        CalibratedCamera::pinhole(500.0, 500.0, 320.0, 240.0, 640, 480)
    }

    fn world_points() -> Vec<Vector3<f64>> {
        (0..40)
            .map(|i| {
                let f = i as f64;
                Vector3::new(
                    (f * 0.37).sin() * 1.5,
                    (f * 0.73).cos() * 1.0,
                    3.0 + (f * 0.51).sin(),
                )
            })
            .collect()
    }

    fn true_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02),
            Vector3::new(0.2, -0.1, 0.3),
        )
    }

    #[test]
    fn test_real_roots_quartic() {
        // (x-1)(x-2)(x+3)(x-0.5)
        let p = poly_mul(&poly_mul(&[-1.0, 1.0], &[-2.0, 1.0]), &poly_mul(&[3.0, 1.0], &[-0.5, 1.0]));
        let mut roots = real_roots(&p);
        roots.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(roots.len(), 4);
        assert_relative_eq!(roots[0], -3.0, epsilon = 1e-9);
        assert_relative_eq!(roots[3], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_p3p_contains_true_pose() {
        let pose_cw = true_pose().inverse();
        let world = [
            Vector3::new(0.5, 0.2, 3.0),
            Vector3::new(-0.7, 0.4, 4.0),
            Vector3::new(0.1, -0.6, 3.5),
        ];
        let rays = world.map(|p| pose_cw.transform_point(&p).normalize());
        let solutions = p3p(&world, &rays);
        assert!(!solutions.is_empty());
        let best = solutions
            .iter()
            .map(|s| s.distance_to(&pose_cw) + s.angle_to(&pose_cw))
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-6, "closest solution off by {}", best);
    }

    #[test]
    fn test_pnp_ransac_with_outliers() {
        let cam = camera();
        let pose_cw = true_pose().inverse();
        let pts = world_points();
        let mut pixels: Vec<Vector2<f64>> = pts
            .iter()
            .map(|p| cam.project(&pose_cw.transform_point(p)).unwrap())
            .collect();
        for i in (0..pixels.len()).step_by(5) {
            pixels[i] += Vector2::new(40.0, -30.0);
        }
        let result = solve_pnp_ransac(&pts, &pixels, &cam, &PnpParams::default()).unwrap();
        assert_eq!(result.num_inliers(), 32);
        assert!(result.pose.distance_to(&true_pose()) < 1e-4);
        assert!(result.pose.angle_to(&true_pose()) < 1e-4);
        assert!(!result.inlier_mask[0]);
    }

    #[test]
    fn test_refine_pose_from_perturbed_prior() {
        let cam = camera();
        let pose_cw = true_pose().inverse();
        let pts = world_points();
        let pixels: Vec<_> = pts
            .iter()
            .map(|p| cam.project(&pose_cw.transform_point(p)).unwrap())
            .collect();
        let prior = true_pose().retract_left(&Vector3::new(0.004, 0.0, -0.004), &Vector3::new(0.01, 0.0, 0.0));
        let result = refine_pose(&prior, &pts, &pixels, &cam, &PnpParams::default());
        assert_relative_eq!(result.pose.translation, true_pose().translation, epsilon = 1e-6);
        assert_eq!(result.num_inliers(), pts.len());
    }

    #[test]
    fn test_weights_discount_coarse_observations() {
        let cam = camera();
        let pose_cw = true_pose().inverse();
        let pts = world_points();
        let mut pixels: Vec<_> = pts
            .iter()
            .map(|p| cam.project(&pose_cw.transform_point(p)).unwrap())
            .collect();
        let truth = true_pose();
        // Three correspondences are biased by 3 px but carry a coarse-level weight.
        let mut weights = vec![1.0; pts.len()];
        for i in 0..3 {
            pixels[i].x += 3.0;
            weights[i] = 1.0 / 1.2f64.powi(14);
        }
        let plain = refine_pose(&truth, &pts, &pixels, &cam, &PnpParams::default());
        let weighted = refine_pose_weighted(&truth, &pts, &pixels, &weights, &cam, &PnpParams::default());
        assert!(weighted.pose.distance_to(&truth) < plain.pose.distance_to(&truth));
        assert!(weighted.pose.distance_to(&truth) < 1e-3);
    }

    #[test]
    fn test_too_few_correspondences() {
        let cam = camera();
        let pts = vec![Vector3::new(0.0, 0.0, 1.0); 3];
        let px = vec![Vector2::new(320.0, 240.0); 3];
        assert!(solve_pnp_ransac(&pts, &px, &cam, &PnpParams::default()).is_none());
    }
}
