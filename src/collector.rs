//! Frame backpressure: coalesces frames that arrive while a prediction is
//! running into the next call, with a bounded backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::coords::{ModelPoint, Screen};
use crate::events::Emitter;
use crate::runtime::ModelRuntime;
use crate::trainer::Trainer;
use crate::types::{Coord, GazeEstimate, LandmarkSet, Losses, Sample};

#[derive(Default)]
struct Backlog {
    samples: VecDeque<Sample>,
    in_flight: bool,
}

struct Inner {
    runtime: Arc<ModelRuntime>,
    trainer: Mutex<Option<Arc<Trainer>>>,
    screen: Screen,
    capacity: usize,
    backlog: Mutex<Backlog>,
    predictions: Emitter<GazeEstimate>,
    next_index: AtomicU64,
}

/// Feeds frames to the inference runtime with at most one call in flight.
pub struct SampleCollector {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SampleCollector {
    pub fn new(runtime: Arc<ModelRuntime>, screen: Screen, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                trainer: Mutex::new(None),
                screen,
                capacity: capacity.max(1),
                backlog: Mutex::new(Backlog::default()),
                predictions: Emitter::new(),
                next_index: AtomicU64::new(0),
            }),
        }
    }

    /// Targeted samples go to this trainer while it is training.
    pub fn set_trainer(&self, trainer: Option<Arc<Trainer>>) {
        *lock(&self.inner.trainer) = trainer;
    }

    pub fn predictions(&self) -> &Emitter<GazeEstimate> {
        &self.inner.predictions
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.inner.backlog).samples.len()
    }

    pub fn in_flight(&self) -> bool {
        lock(&self.inner.backlog).in_flight
    }

    /// Takes one frame. `target_px` is the on-screen point the user is
    /// looking at, if known. Must be called from within a Tokio runtime.
    pub fn collect(&self, landmarks: LandmarkSet, target_px: Option<Coord>) {
        let sample = Sample::new(landmarks, self.inner.screen.to_model(target_px));

        if sample.target.is_some() {
            let trainer = lock(&self.inner.trainer).clone();
            if let Some(trainer) = trainer.filter(|t| t.is_training()) {
                trainer.add_sample(sample.clone());
            }
        }

        let batch = {
            let mut backlog = lock(&self.inner.backlog);
            backlog.samples.push_back(sample);
            while backlog.samples.len() > self.inner.capacity {
                backlog.samples.pop_front();
            }
            if backlog.in_flight {
                return;
            }
            backlog.in_flight = true;
            backlog.samples.drain(..).collect::<Vec<_>>()
        };

        tokio::spawn(Arc::clone(&self.inner).submit(batch));
    }
}

impl Inner {
    async fn submit(self: Arc<Self>, mut batch: Vec<Sample>) {
        loop {
            let sets: Vec<LandmarkSet> = batch.iter().map(|s| s.landmarks.clone()).collect();
            tracing::debug!("Predicting batch of {}", sets.len());

            match self.runtime.predict(&sets).await {
                Ok(predicted) => {
                    if let (Some(last), Some(gaze)) = (batch.last(), predicted.last()) {
                        self.emit(last, *gaze);
                    }
                }
                Err(e) => {
                    tracing::warn!("Prediction of {} frames failed: {}", batch.len(), e);
                    let mut backlog = lock(&self.backlog);
                    for sample in batch.into_iter().rev() {
                        backlog.samples.push_front(sample);
                    }
                    while backlog.samples.len() > self.capacity {
                        backlog.samples.pop_front();
                    }
                    backlog.in_flight = false;
                    return;
                }
            }

            let mut backlog = lock(&self.backlog);
            if backlog.samples.is_empty() {
                backlog.in_flight = false;
                return;
            }
            batch = backlog.samples.drain(..).collect();
        }
    }

    fn emit(&self, sample: &Sample, gaze: Coord) {
        let losses = sample
            .target
            .map(|target| Losses::between(gaze, target))
            .unwrap_or_default();
        let estimate = GazeEstimate {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            gaze: self.screen.to_screen(ModelPoint::Normalized(gaze)),
            losses,
        };
        self.predictions.emit(&estimate);
    }
}
