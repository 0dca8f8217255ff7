//! Face landmarks as produced by a face-mesh tracker.

/// Number of points in a face-mesh landmark list.
pub const FACE_MESH_POINTS: usize = 468;

/// Top of the forehead.
pub const FOREHEAD_TOP: usize = 10;
pub const LEFT_EYE_OUTER: usize = 33;
pub const RIGHT_EYE_OUTER: usize = 263;
pub const LEFT_EYE_INNER: usize = 159;
pub const RIGHT_EYE_INNER: usize = 386;

/// A tracked feature point in normalized image coordinates.
///
/// `x` and `y` lie in [0, 1] with the origin at the top-left of the frame.
/// `z` is relative depth and unused by the renderers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Looks up a landmark by anatomical index. Lists may be momentarily short
/// while the tracker reacquires a face.
pub fn get(landmarks: &[Landmark], index: usize) -> Option<Landmark> {
    landmarks.get(index).copied()
}
