//! Background training loop over a rolling dataset.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::TrainerConfig;
use crate::dataset::Dataset;
use crate::error::GazeResult;
use crate::events::Emitter;
use crate::runtime::ModelRuntime;
use crate::trainable::TrainableRuntime;
use crate::types::{flatten_landmarks, Coord, LandmarkSet, Losses, Sample};

#[derive(Debug, Clone, PartialEq)]
pub enum TrainerEvent {
    EpochStart { total: usize },
    Progress { current: usize, total: usize, losses: Losses },
    Loss(Losses),
    Failed { message: String },
}

struct Shared {
    config: TrainerConfig,
    trainable: Arc<TrainableRuntime>,
    runtime: Option<Arc<ModelRuntime>>,
    dataset: Mutex<Dataset>,
    stop: AtomicBool,
    epoch: AtomicU64,
    events: Emitter<TrainerEvent>,
}

/// Trains the regressor on whatever the dataset holds, one epoch after
/// another, until stopped. Stopping is cooperative: the running epoch always
/// completes.
pub struct Trainer {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Trainer {
    pub fn new(config: TrainerConfig, trainable: Arc<TrainableRuntime>, runtime: Option<Arc<ModelRuntime>>) -> Self {
        let dataset = Dataset::new(config.dataset_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                trainable,
                runtime,
                dataset: Mutex::new(dataset),
                stop: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                events: Emitter::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &Emitter<TrainerEvent> {
        &self.shared.events
    }

    pub fn is_training(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the epoch loop. Does nothing while already training.
    pub fn start_training(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Training already running");
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared))));
    }

    /// Requests a stop and waits for the running epoch to finish.
    pub async fn stop_training(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Training task ended abnormally: {}", e);
            }
            tracing::info!("Training stopped after {} epochs", self.epoch());
        }
    }

    /// Queues a labelled sample. Samples without a target are ignored.
    pub fn add_sample(&self, sample: Sample) {
        if sample.target.is_none() {
            return;
        }
        lock(&self.shared.dataset).add(sample);
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn sample_count(&self) -> usize {
        lock(&self.shared.dataset).len()
    }

    pub fn save_dataset(&self, path: &Path) -> Result<()> {
        let snapshot = lock(&self.shared.dataset).clone();
        snapshot.save(path)
    }

    /// Replaces the dataset with a saved one. Untargeted samples are dropped.
    pub fn load_dataset(&self, path: &Path) -> Result<()> {
        let loaded = Dataset::load(path, self.shared.config.dataset_capacity)?;
        let mut dataset = Dataset::new(self.shared.config.dataset_capacity);
        for sample in loaded.to_snapshot().into_iter().filter(|s| s.target.is_some()) {
            dataset.add(sample);
        }
        *lock(&self.shared.dataset) = dataset;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(shared: Arc<Shared>) {
    let mut rng = match shared.config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let backoff = Duration::from_millis(shared.config.idle_backoff_ms);
    tracing::info!("Training started");

    while !shared.stop.load(Ordering::Acquire) {
        match shared.run_epoch(&mut rng).await {
            Ok(Some(losses)) => {
                tracing::info!(
                    "Epoch {} loss {:.4} (h {:.4}, v {:.4})",
                    shared.epoch.load(Ordering::Acquire),
                    losses.loss,
                    losses.h_loss,
                    losses.v_loss
                );
            }
            Ok(None) => tokio::time::sleep(backoff).await,
            Err(e) => {
                tracing::error!("Training failed: {}", e);
                shared.events.emit(&TrainerEvent::Failed { message: e.to_string() });
                break;
            }
        }
        tokio::task::yield_now().await;
    }
}

fn aggregate(h_sum: f32, v_sum: f32, seen: usize) -> Losses {
    if seen == 0 {
        return Losses::default();
    }
    let h_loss = h_sum / seen as f32;
    let v_loss = v_sum / seen as f32;
    Losses {
        h_loss,
        v_loss,
        loss: (h_loss + v_loss) / 2.0,
    }
}

impl Shared {
    /// One pass over a shuffled snapshot. `None` when there is not enough
    /// data yet.
    async fn run_epoch(&self, rng: &mut StdRng) -> GazeResult<Option<Losses>> {
        let mut snapshot = lock(&self.dataset).to_snapshot();
        snapshot.retain(|s| s.target.is_some());
        if snapshot.len() < self.config.min_samples.max(1) {
            return Ok(None);
        }
        snapshot.shuffle(rng);

        let batch_size = self.config.batch_size.max(1);
        let total = snapshot.len().div_ceil(batch_size);
        self.events.emit(&TrainerEvent::EpochStart { total });

        let (mut h_sum, mut v_sum, mut seen) = (0.0f32, 0.0f32, 0usize);
        for (index, batch) in snapshot.chunks(batch_size).enumerate() {
            let n = batch.len();
            let targets: Vec<Coord> = batch.iter().filter_map(|s| s.target).collect();
            let flat_targets: Vec<f32> = targets.iter().flat_map(|t| [t.x, t.y]).collect();
            let landmarks = flatten_landmarks(batch.iter().map(|s| &s.landmarks));

            let features = self.trainable.transform(landmarks, n).await?;
            let batch_losses = self
                .trainable
                .train_batch(features.clone(), flat_targets, n, batch_size, 1, self.config.learning_rate)
                .await?;
            tracing::debug!("Batch of {} trained, loss {:?}", n, batch_losses);

            let predicted = self.measure(batch, features).await?;
            for (p, t) in predicted.iter().zip(&targets) {
                let l = Losses::between(*p, *t);
                h_sum += l.h_loss;
                v_sum += l.v_loss;
            }
            seen += n;

            self.events.emit(&TrainerEvent::Progress {
                current: index + 1,
                total,
                losses: aggregate(h_sum, v_sum, seen),
            });
        }

        let losses = aggregate(h_sum, v_sum, seen);
        self.events.emit(&TrainerEvent::Loss(losses));
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        if self.config.handoff_every > 0 && epoch % self.config.handoff_every == 0 {
            self.handoff().await;
        }
        Ok(Some(losses))
    }

    /// Predictions for a trained batch, through the shared inference queue
    /// when it is up.
    async fn measure(&self, batch: &[Sample], features: Vec<f32>) -> GazeResult<Vec<Coord>> {
        if let Some(runtime) = self.runtime.as_ref().filter(|rt| rt.is_ready()) {
            let sets: Vec<LandmarkSet> = batch.iter().map(|s| s.landmarks.clone()).collect();
            return runtime.predict(&sets).await;
        }
        let out = self.trainable.evaluate(features, batch.len()).await?;
        Ok(out.chunks_exact(2).map(|xy| Coord::new(xy[0], xy[1])).collect())
    }

    async fn handoff(&self) {
        let Some(runtime) = self.runtime.as_ref().filter(|rt| rt.is_ready()) else {
            return;
        };
        if !self.trainable.produces_features().await {
            tracing::debug!("Keeping inference weights: regressor was trained on placeholder features");
            return;
        }
        match self.trainable.export_weights().await {
            Ok(Some(bytes)) => {
                if let Err(e) = runtime.install_weights(bytes).await {
                    tracing::warn!("Could not install trained weights: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not export trained weights: {}", e),
        }
    }
}
