//! Kinematic helpers shared by nodes, transformations and two-node elements.

use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, Vector3};

/// Position in three dimensional space measured in metres.
pub type Point = Vector3<f64>;

/// Cartesian force in newtons.
pub type Force = Vector3<f64>;

/// Convenience helper for creating [`Point`] instances.
///
/// # Examples
/// ```
/// use femstate::point;
///
/// let origin = point(0.0, 0.0, 0.0);
/// assert_eq!(origin.x, 0.0);
/// ```
#[must_use]
pub fn point(x: f64, y: f64, z: f64) -> Point {
    Vector3::new(x, y, z)
}

/// Convenience helper for creating [`Force`] instances.
///
/// # Examples
/// ```
/// use femstate::force;
///
/// let load = force(1.0, 0.0, -5.0);
/// assert_eq!(load.z, -5.0);
/// ```
#[must_use]
pub fn force(x: f64, y: f64, z: f64) -> Force {
    Vector3::new(x, y, z)
}

/// Undeformed position and trial displacement of a node, as seen by an element.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeState {
    /// Undeformed coordinates.
    pub coords: Point,
    /// Trial displacement.
    pub displacement: Vector3<f64>,
}

impl NodeState {
    /// Deformed position.
    #[must_use]
    pub fn current(&self) -> Point {
        self.coords + self.displacement
    }
}

/// Axial stiffness of a two-node bar in global coordinates.
///
/// `direction` is the unit vector from the first to the second node and
/// `ea_over_l` the axial stiffness of the bar.
#[must_use]
pub fn axial_stiffness(direction: &Vector3<f64>, ea_over_l: f64) -> SMatrix<f64, 6, 6> {
    let l = direction[0];
    let m = direction[1];
    let n = direction[2];

    ea_over_l
        * SMatrix::<f64, 6, 6>::from_row_slice(&[
            l * l,
            l * m,
            l * n,
            -l * l,
            -l * m,
            -l * n,
            l * m,
            m * m,
            m * n,
            -l * m,
            -m * m,
            -m * n,
            l * n,
            m * n,
            n * n,
            -l * n,
            -m * n,
            -n * n,
            -l * l,
            -l * m,
            -l * n,
            l * l,
            l * m,
            l * n,
            -l * m,
            -m * m,
            -m * n,
            l * m,
            m * m,
            m * n,
            -l * n,
            -m * n,
            -n * n,
            l * n,
            m * n,
            n * n,
        ])
}

/// Expand a 3x3 nodal block `b` into the two-node pattern `[b, -b; -b, b]`.
#[must_use]
pub fn two_node_block(block: &Matrix3<f64>) -> SMatrix<f64, 6, 6> {
    let mut matrix = SMatrix::<f64, 6, 6>::zeros();
    matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(block);
    matrix.fixed_view_mut::<3, 3>(3, 3).copy_from(block);
    matrix.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-block));
    matrix.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-block));
    matrix
}

/// Nodal forces of a bar carrying `axial_force` along `direction`.
#[must_use]
pub fn axial_forces(direction: &Vector3<f64>, axial_force: f64) -> DVector<f64> {
    let end = direction * axial_force;
    DVector::from_column_slice(&[-end.x, -end.y, -end.z, end.x, end.y, end.z])
}

/// Copy a fixed-size element matrix into a dynamically sized one.
#[must_use]
pub fn to_dynamic(matrix: &SMatrix<f64, 6, 6>) -> DMatrix<f64> {
    DMatrix::from_column_slice(6, 6, matrix.as_slice())
}
