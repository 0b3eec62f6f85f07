use serde::{Deserialize, Serialize};

use crate::types::{Coord, Point3D};

/// Screen geometry used to map between pixels and model space.
///
/// Model space is centered: `(-1, -1)` is the top-left corner and `(1, 1)` the
/// bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Screen {
    pub width: f32,
    pub height: f32,
}

impl Default for Screen {
    fn default() -> Self {
        Self {
            width: 1440.0,
            height: 900.0,
        }
    }
}

/// Input to [`Screen::to_screen`].
#[derive(Debug, Clone, Copy)]
pub enum ModelPoint {
    /// Normalized `[-1, 1]` model output.
    Normalized(Coord),
    /// Already in pixels; z is ignored.
    Pixel(Point3D),
}

impl Screen {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn to_screen(&self, point: ModelPoint) -> Coord {
        let (x, y) = match point {
            ModelPoint::Normalized(c) => (
                ((c.x / 2.0) + 0.5) * self.width,
                ((c.y / 2.0) + 0.5) * self.height,
            ),
            ModelPoint::Pixel(p) => (p.x, p.y),
        };
        Coord::new(x.round(), y.round())
    }

    pub fn to_model(&self, point: Option<Coord>) -> Option<Coord> {
        let p = point?;
        Some(Coord::new(
            ((p.x / self.width) - 0.5) * 2.0,
            ((p.y / self.height) - 0.5) * 2.0,
        ))
    }
}
