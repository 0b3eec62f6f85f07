//! One gaze-tracking session: the adapters, the trainer, the collector and the
//! frame loop that feeds them.

use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};

use crate::collector::SampleCollector;
use crate::config::AppConfig;
use crate::events::Emitter;
use crate::runtime::ModelRuntime;
use crate::source::{Detection, LandmarkSource, TargetProvider};
use crate::store::{FileStore, WeightStore};
use crate::trainable::TrainableRuntime;
use crate::trainer::{Trainer, TrainerEvent};
use crate::types::GazeEstimate;

/// A spawned frame loop. `done` turns `Some(faces)` when the loop ends.
struct FrameLoop {
    stop: oneshot::Sender<()>,
    done: watch::Receiver<Option<u64>>,
}

impl FrameLoop {
    fn is_running(&self) -> bool {
        // a dropped sender means the loop task died
        self.done.borrow().is_none() && self.done.has_changed().is_ok()
    }
}

/// Waits for a frame loop to end without holding any session lock.
async fn wait_done(mut done: watch::Receiver<Option<u64>>) -> u64 {
    let finished = *done.borrow();
    if let Some(collected) = finished {
        return collected;
    }
    match done.wait_for(Option::is_some).await {
        Ok(collected) => (*collected).unwrap_or(0),
        Err(_) => {
            tracing::error!("Frame loop ended abnormally");
            0
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct GazeSession {
    config: AppConfig,
    runtime: Arc<ModelRuntime>,
    trainable: Arc<TrainableRuntime>,
    trainer: Arc<Trainer>,
    collector: Arc<SampleCollector>,
    store: Arc<dyn WeightStore>,
    frames: Mutex<Option<FrameLoop>>,
}

impl GazeSession {
    /// Session over the configured model assets and a file store.
    pub fn new(config: AppConfig) -> Self {
        let runtime = ModelRuntime::new(config.assets.clone());
        let trainable = TrainableRuntime::new(config.assets.clone());
        let store = Arc::new(FileStore::new(config.store.dir.clone()));
        Self::with_parts(config, runtime, trainable, store)
    }

    pub fn with_parts(
        config: AppConfig,
        runtime: ModelRuntime,
        trainable: TrainableRuntime,
        store: Arc<dyn WeightStore>,
    ) -> Self {
        let runtime = Arc::new(runtime);
        let trainable = Arc::new(trainable);
        let trainer = Arc::new(Trainer::new(
            config.trainer.clone(),
            Arc::clone(&trainable),
            Some(Arc::clone(&runtime)),
        ));
        let collector = Arc::new(SampleCollector::new(
            Arc::clone(&runtime),
            config.screen,
            config.collector.backlog_capacity,
        ));
        collector.set_trainer(Some(Arc::clone(&trainer)));

        Self {
            config,
            runtime,
            trainable,
            trainer,
            collector,
            store,
            frames: Mutex::new(None),
        }
    }

    /// Loads saved weights (falling back to the default model), brings up
    /// both adapters and restores the persisted dataset.
    pub async fn init(&self) -> Result<()> {
        if !self.runtime.is_ready() {
            let saved = match self.store.load(&self.config.store.model_key) {
                Ok(saved) => saved,
                Err(e) => {
                    tracing::warn!("Could not read saved model: {:#}", e);
                    None
                }
            };
            if saved.is_some() {
                tracing::info!("Using saved model '{}'", self.config.store.model_key);
            }
            self.runtime.init(saved).await?;
        }

        if !self.trainable.is_initialized() {
            self.trainable.init().await?;
        }

        if let Some(path) = self.config.trainer.dataset_path.as_deref().filter(|p| p.exists()) {
            if let Err(e) = self.trainer.load_dataset(path) {
                tracing::warn!("Could not restore dataset: {:#}", e);
            }
        }
        Ok(())
    }

    /// Spawns the frame loop. Each detected face is collected together with
    /// the target current at that moment. The loop ends at end of stream or
    /// on [`GazeSession::term`].
    pub fn start_detection<S, T>(&self, source: S, targets: T)
    where
        S: LandmarkSource + 'static,
        T: TargetProvider + 'static,
    {
        let mut frames = lock(&self.frames);
        if frames.as_ref().is_some_and(FrameLoop::is_running) {
            tracing::warn!("Detection already running");
            return;
        }
        let (stop, stopped) = oneshot::channel();
        let (finished, done) = watch::channel(None);
        let collector = Arc::clone(&self.collector);
        tokio::spawn(async move {
            let collected = frame_loop(source, targets, collector, stopped).await;
            let _ = finished.send(Some(collected));
        });
        *frames = Some(FrameLoop { stop, done });
        tracing::info!("Detection started");
    }

    pub fn is_detecting(&self) -> bool {
        lock(&self.frames).as_ref().is_some_and(FrameLoop::is_running)
    }

    /// Waits for the frame loop to end, on its own or through
    /// [`GazeSession::term`]. Returns the number of faces it collected.
    pub async fn join_detection(&self) -> u64 {
        let done = match lock(&self.frames).as_ref() {
            Some(running) => running.done.clone(),
            None => return 0,
        };
        wait_done(done).await
    }

    pub fn start_training(&self) {
        self.trainer.start_training();
    }

    pub async fn stop_training(&self) {
        self.trainer.stop_training().await;
    }

    pub fn is_training(&self) -> bool {
        self.trainer.is_training()
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn predictions(&self) -> &Emitter<GazeEstimate> {
        self.collector.predictions()
    }

    pub fn trainer_events(&self) -> &Emitter<TrainerEvent> {
        self.trainer.events()
    }

    /// Persists the current inference weights. Failures are logged and
    /// reported as `false`.
    pub async fn save_model(&self) -> bool {
        let Some(bytes) = self.runtime.export_weights().await else {
            tracing::warn!("No model weights to save");
            return false;
        };
        let store = Arc::clone(&self.store);
        let key = self.config.store.model_key.clone();
        match tokio::task::spawn_blocking(move || store.save(&key, &bytes)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("Failed to save model: {:#}", e);
                false
            }
            Err(e) => {
                tracing::error!("Model save task failed: {}", e);
                false
            }
        }
    }

    /// Stops training and detection, then persists the dataset if configured.
    pub async fn term(&self) {
        self.trainer.stop_training().await;

        let running = lock(&self.frames).take();
        if let Some(FrameLoop { stop, done }) = running {
            let _ = stop.send(());
            let collected = wait_done(done).await;
            tracing::info!("Detection stopped after {} faces", collected);
        }

        if let Some(path) = self.config.trainer.dataset_path.as_deref() {
            if let Err(e) = self.trainer.save_dataset(path) {
                tracing::warn!("Could not persist dataset: {:#}", e);
            }
        }
    }
}

async fn frame_loop<S, T>(
    mut source: S,
    targets: T,
    collector: Arc<SampleCollector>,
    mut stop: oneshot::Receiver<()>,
) -> u64
where
    S: LandmarkSource,
    T: TargetProvider,
{
    let mut collected = 0u64;
    loop {
        let detection = tokio::select! {
            _ = &mut stop => break,
            detection = source.next_frame() => detection,
        };
        match detection {
            Ok(Detection::Face(landmarks)) => {
                collector.collect(landmarks, targets.current_target());
                collected += 1;
            }
            Ok(Detection::NoFace) => {}
            Ok(Detection::EndOfStream) => {
                tracing::info!("Landmark source exhausted after {} faces", collected);
                break;
            }
            Err(e) => tracing::warn!("Landmark detection failed: {:#}", e),
        }
        tokio::task::yield_now().await;
    }
    collected
}
