//! Test doubles for the engine seams.
//!
//! Frames are tagged by writing an id into the x of their first landmark. The
//! mock reducer carries that id into feature 0, so regressors can record which
//! samples they saw.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::stage::{InferenceStage, TrainableStage};
use crate::types::{Coord, LandmarkSet, Point3D, Sample, LANDMARK_COUNT, LANDMARK_FLOATS};

pub fn landmarks(id: f32) -> LandmarkSet {
    let mut points = vec![Point3D::default(); LANDMARK_COUNT];
    points[0].x = id;
    LandmarkSet::new(points).unwrap()
}

pub fn sample(id: f32, target: Option<Coord>) -> Sample {
    Sample::new(landmarks(id), target)
}

fn first_of_rows(input: &[f32], batch: usize) -> Vec<f32> {
    if batch == 0 {
        return Vec::new();
    }
    let width = input.len() / batch;
    input.chunks_exact(width).map(|row| row[0]).collect()
}

#[derive(Default)]
pub struct MockLog {
    batches: Mutex<Vec<Vec<f32>>>,
    installed: Mutex<Vec<Vec<u8>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    train_batches: Mutex<Vec<Vec<f32>>>,
    train_steps: AtomicUsize,
    optimizer_steps: AtomicUsize,
    resets: AtomicUsize,
    learning_rates: Mutex<Vec<f32>>,
}

impl MockLog {
    pub fn batches(&self) -> Vec<Vec<f32>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn installed(&self) -> Vec<Vec<u8>> {
        self.installed.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn train_batches(&self) -> Vec<Vec<f32>> {
        self.train_batches.lock().unwrap().clone()
    }

    pub fn train_steps(&self) -> usize {
        self.train_steps.load(Ordering::SeqCst)
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn learning_rates(&self) -> Vec<f32> {
        self.learning_rates.lock().unwrap().clone()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Copies each sample's id into feature 0.
pub struct MockReducer {
    feature_width: usize,
}

impl MockReducer {
    pub fn new(feature_width: usize) -> Self {
        Self { feature_width }
    }
}

fn reduce(input: &[f32], batch: usize, feature_width: usize) -> Result<Vec<f32>> {
    anyhow::ensure!(input.len() == batch * LANDMARK_FLOATS, "bad reducer input");
    let mut out = vec![0.0; batch * feature_width];
    for (i, id) in first_of_rows(input, batch).into_iter().enumerate() {
        out[i * feature_width] = id;
    }
    Ok(out)
}

impl InferenceStage for MockReducer {
    fn name(&self) -> &str {
        "mock-reducer"
    }

    fn run(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        reduce(input, batch, self.feature_width)
    }
}

/// Predicts `(id / 10, -id / 10)` after an artificial delay.
pub struct MockRegressor {
    log: Arc<MockLog>,
    delay: Duration,
    weights: Option<Vec<u8>>,
    fail: bool,
}

impl MockRegressor {
    pub fn new(log: Arc<MockLog>, delay: Duration) -> Self {
        Self {
            log,
            delay,
            weights: None,
            fail: false,
        }
    }

    pub fn failing(log: Arc<MockLog>) -> Self {
        Self {
            fail: true,
            ..Self::new(log, Duration::ZERO)
        }
    }
}

impl InferenceStage for MockRegressor {
    fn name(&self) -> &str {
        "mock-regressor"
    }

    fn run(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        self.log.enter();
        std::thread::sleep(self.delay);
        let ids = first_of_rows(input, batch);
        self.log.batches.lock().unwrap().push(ids.clone());
        self.log.exit();
        anyhow::ensure!(!self.fail, "mock regressor failure");
        Ok(ids.iter().flat_map(|id| [id / 10.0, -id / 10.0]).collect())
    }

    fn export_weights(&self) -> Option<Vec<u8>> {
        self.weights.clone()
    }

    fn load_weights(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.log.installed.lock().unwrap().push(bytes.clone());
        self.weights = Some(bytes);
        Ok(())
    }
}

/// Trainable double. As a reducer it tags features like [`MockReducer`]; as a
/// regressor it records the ids of every trained batch and returns a fixed
/// loss.
pub struct MockTrainable {
    log: Arc<MockLog>,
    feature_width: Option<usize>,
    loss: f32,
    delay: Duration,
    fail_at_step: Option<usize>,
}

impl MockTrainable {
    pub fn reducer(log: Arc<MockLog>, feature_width: usize) -> Self {
        Self {
            log,
            feature_width: Some(feature_width),
            loss: 0.0,
            delay: Duration::ZERO,
            fail_at_step: None,
        }
    }

    pub fn regressor(log: Arc<MockLog>, loss: f32) -> Self {
        Self {
            log,
            feature_width: None,
            loss,
            delay: Duration::ZERO,
            fail_at_step: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }
}

impl TrainableStage for MockTrainable {
    fn name(&self) -> &str {
        match self.feature_width {
            Some(_) => "mock-trainable-reducer",
            None => "mock-trainable-regressor",
        }
    }

    fn train_step(&mut self, input: &[f32], _labels: &[f32], batch: usize) -> Result<f32> {
        std::thread::sleep(self.delay);
        let step = self.log.train_steps.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at_step == Some(step) {
            anyhow::bail!("mock train step {} failed", step);
        }
        if self.feature_width.is_none() {
            self.log.train_batches.lock().unwrap().push(first_of_rows(input, batch));
        }
        Ok(self.loss)
    }

    fn optimizer_step(&mut self) -> Result<()> {
        self.log.optimizer_steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_grad(&mut self) -> Result<()> {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_learning_rate(&mut self, lr: f32) -> Result<()> {
        self.log.learning_rates.lock().unwrap().push(lr);
        Ok(())
    }

    fn eval_step(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        match self.feature_width {
            Some(fw) => reduce(input, batch, fw),
            None => Ok(first_of_rows(input, batch)
                .iter()
                .flat_map(|id| [id / 10.0, -id / 10.0])
                .collect()),
        }
    }

    fn export(&mut self) -> Result<Vec<u8>> {
        Ok(vec![self.log.train_steps() as u8])
    }
}
