//! Where landmarks and gaze targets come from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::types::{Coord, LandmarkSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Face(LandmarkSet),
    NoFace,
    EndOfStream,
}

/// A face-mesh detector. The frame loop keeps at most one `next_frame` call
/// outstanding.
pub trait LandmarkSource: Send {
    fn next_frame(&mut self) -> impl Future<Output = Result<Detection>> + Send;
}

/// The on-screen point the user is looking at, in pixels.
pub trait TargetProvider: Send + Sync {
    fn current_target(&self) -> Option<Coord>;
}

/// A target the UI (or a replay) updates and the frame loop reads.
#[derive(Debug, Clone, Default)]
pub struct SharedTarget(Arc<Mutex<Option<Coord>>>);

impl SharedTarget {
    pub fn set(&self, target: Option<Coord>) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = target;
    }
}

impl TargetProvider for SharedTarget {
    fn current_target(&self) -> Option<Coord> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Deserialize)]
struct CaptureRecord {
    #[serde(default)]
    landmarks: Option<LandmarkSet>,
    #[serde(default)]
    target: Option<Coord>,
}

/// Replays a JSON-lines capture, one record per frame:
/// `{"landmarks": [[x, y, z], ...], "target": {"x": .., "y": ..}}`.
/// A record without landmarks is a frame with no face.
pub struct ReplaySource {
    path: PathBuf,
    lines: Vec<String>,
    next: usize,
    ticker: Option<Interval>,
    target: SharedTarget,
}

impl ReplaySource {
    /// A rate with no usable frame period (not positive, infinite, or out
    /// of `Duration` range either way) replays as fast as frames are
    /// requested.
    pub async fn open(path: &Path, fps: f32, target: SharedTarget) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read capture {}", path.display()))?;
        let lines: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        tracing::info!("Replaying {} frames from {} at {} fps", lines.len(), path.display(), fps);

        let period = (fps > 0.0)
            .then(|| Duration::try_from_secs_f32(1.0 / fps).ok())
            .flatten()
            .filter(|p| !p.is_zero());
        let ticker = period.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            next: 0,
            ticker,
            target,
        })
    }
}

impl LandmarkSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Detection> {
        let Some(line) = self.lines.get(self.next) else {
            return Ok(Detection::EndOfStream);
        };
        let line_no = self.next + 1;
        self.next += 1;
        let record: CaptureRecord = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: bad capture record", self.path.display(), line_no))?;

        if let Some(ticker) = self.ticker.as_mut() {
            ticker.tick().await;
        }
        self.target.set(record.target);
        Ok(match record.landmarks {
            Some(set) => Detection::Face(set),
            None => Detection::NoFace,
        })
    }
}
