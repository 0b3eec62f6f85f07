//! Webcam gaze estimation from face-mesh landmarks: a two-stage ONNX model
//! (landmark reducer + gaze regressor), incremental on-device training of the
//! regressor, and frame backpressure between the detector and the model.

pub mod collector;
pub mod config;
pub mod coords;
pub mod dataset;
pub mod error;
pub mod events;
pub mod runtime;
pub mod session;
pub mod source;
pub mod stage;
pub mod store;
pub mod trainable;
pub mod trainer;
pub mod types;

#[cfg(test)]
mod mock;

pub use error::{GazeError, GazeResult};
pub use session::GazeSession;
pub use types::{Coord, GazeEstimate, LandmarkSet, Losses, Point3D, Sample};
