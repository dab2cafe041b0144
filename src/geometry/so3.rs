//! SO(3) helpers shared by the two-view and PnP solvers.

use nalgebra::{Matrix3, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Nearest rotation matrix (Frobenius norm) to an arbitrary 3x3 matrix.
///
/// Returns `None` if the SVD fails to produce both singular bases.
pub fn project_to_so3(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }
    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    #[test]
    fn test_skew_cross_product() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(-0.5, 0.4, 2.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let s = skew(&Vector3::new(0.3, -1.2, 4.0));
        assert_relative_eq!(s + s.transpose(), Matrix3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_project_to_so3_recovers_rotation() {
        let r = Rotation3::from_euler_angles(0.2, 0.4, -0.1).into_inner();
        let noisy = r * 2.5 + Matrix3::from_element(1e-4);
        let projected = project_to_so3(&noisy).unwrap();
        assert_relative_eq!(projected, r, epsilon = 1e-3);
        assert_relative_eq!(projected.determinant(), 1.0, epsilon = 1e-9);
    }
}
