use serde::{Deserialize, Serialize};

use crate::error::GazeError;

/// Number of landmarks the face mesh produces per face.
pub const LANDMARK_COUNT: usize = 478;

/// Floats per landmark set once flattened (`x, y, z` interleaved).
pub const LANDMARK_FLOATS: usize = LANDMARK_COUNT * 3;

/// Represents a single 3D point
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<[f32; 3]> for Point3D {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Point3D> for [f32; 3] {
    fn from(p: Point3D) -> Self {
        [p.x, p.y, p.z]
    }
}

/// A 2D coordinate. Screen pixels or model space depending on context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f32,
    pub y: f32,
}

impl Coord {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One face worth of mesh landmarks. Always exactly [`LANDMARK_COUNT`] points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point3D>", into = "Vec<Point3D>")]
pub struct LandmarkSet {
    points: Vec<Point3D>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point3D>) -> Result<Self, GazeError> {
        if points.len() != LANDMARK_COUNT {
            return Err(GazeError::LandmarkCount {
                expected: LANDMARK_COUNT,
                actual: points.len(),
            });
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point3D] {
        &self.points
    }

    /// Appends the points as `x, y, z` triples to `out`.
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        out.reserve(LANDMARK_FLOATS);
        for p in &self.points {
            out.extend_from_slice(&[p.x, p.y, p.z]);
        }
    }
}

impl TryFrom<Vec<Point3D>> for LandmarkSet {
    type Error = GazeError;

    fn try_from(points: Vec<Point3D>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<LandmarkSet> for Vec<Point3D> {
    fn from(set: LandmarkSet) -> Self {
        set.points
    }
}

/// Flattens a batch into one `[n, 478, 3]` buffer.
pub fn flatten_landmarks<'a>(sets: impl IntoIterator<Item = &'a LandmarkSet>) -> Vec<f32> {
    let mut out = Vec::new();
    for set in sets {
        set.flatten_into(&mut out);
    }
    out
}

/// A labelled (or unlabelled) observation. The target is in model space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub landmarks: LandmarkSet,
    pub target: Option<Coord>,
}

impl Sample {
    pub fn new(landmarks: LandmarkSet, target: Option<Coord>) -> Self {
        Self { landmarks, target }
    }
}

/// Horizontal, vertical and combined error, in model-normalized units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Losses {
    pub h_loss: f32,
    pub v_loss: f32,
    pub loss: f32,
}

impl Losses {
    /// Absolute error of `predicted` against `target`.
    pub fn between(predicted: Coord, target: Coord) -> Self {
        let h_loss = (predicted.x - target.x).abs();
        let v_loss = (predicted.y - target.y).abs();
        Self {
            h_loss,
            v_loss,
            loss: (h_loss + v_loss) / 2.0,
        }
    }
}

/// Prediction event payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GazeEstimate {
    pub index: u64,
    /// Screen pixels.
    pub gaze: Coord,
    pub losses: Losses,
}
