//! Plane geometry shared by the intrinsic and extrinsic solvers: rotation
//! vector conversions, homography estimation and homography decomposition.

use nalgebra::{DMatrix, Matrix3, Point2, Rotation3, Vector3};

const DEGENERATE_EPS: f64 = 1e-12;

/// Rotation matrix of a Rodrigues rotation vector.
pub fn rotation_from_vector(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*rvec).into_inner()
}

/// Rodrigues rotation vector of a rotation matrix.
///
/// The matrix is re-orthonormalised first, so slightly drifted rotations are
/// accepted.
pub fn vector_from_rotation(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(rotation).scaled_axis()
}

/// Similarity that moves the centroid of `points` to the origin and scales
/// their mean distance to `sqrt(2)`.
fn normalization_transform(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < DEGENERATE_EPS {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s, 0.0, -s * cx, //
        0.0, s, -s * cy, //
        0.0, 0.0, 1.0,
    ))
}

fn transform_point(t: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = t * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Estimates `H` such that `dst ~ H · src` with the normalised DLT.
///
/// Returns `None` for fewer than four correspondences, mismatched lengths or
/// a degenerate (e.g. collinear) configuration.
pub fn find_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }

    let t_src = normalization_transform(src)?;
    let t_dst = normalization_transform(dst)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (ps, pd)) in src.iter().zip(dst.iter()).enumerate() {
        let s = transform_point(&t_src, ps);
        let d = transform_point(&t_dst, pd);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Null vector of A from the 9x9 normal matrix, so four points still work.
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t?;
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let largest = svd.singular_values[order[order.len() - 1]];
    if largest <= 0.0 || svd.singular_values[order[1]] <= DEGENERATE_EPS * largest {
        return None;
    }
    let h = v_t.row(order[0]);

    let mut h_norm = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_norm[(r, c)] = h[3 * r + c];
        }
    }

    let t_dst_inv = t_dst.try_inverse()?;
    let mut h_mat = t_dst_inv * h_norm * t_src;
    let scale = h_mat[(2, 2)];
    if scale.abs() > DEGENERATE_EPS {
        h_mat /= scale;
    }
    if h_mat.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(h_mat)
}

/// Applies a homography to a point.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < DEGENERATE_EPS {
        return None;
    }
    Some(Point2::new(v.x / v.z, v.y / v.z))
}

/// Decomposes a homography from the `z = 0` plane to normalised image
/// coordinates into a rotation and translation, with the plane in front of
/// the camera (`t.z > 0`).
pub fn planar_pose_from_homography(h: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norm1 = h1.norm();
    let norm2 = h2.norm();
    if norm1 < DEGENERATE_EPS || norm2 < DEGENERATE_EPS {
        return None;
    }
    let mut lambda = 2.0 / (norm1 + norm2);
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // Closest rotation in the Frobenius sense.
    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        rotation = u_flipped * v_t;
    }

    let translation = h3 * lambda;
    if !translation.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some((rotation, translation))
}
