use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

mod args;

use args::Args;
use rusty_gaze::config::AppConfig;
use rusty_gaze::source::{ReplaySource, SharedTarget};
use rusty_gaze::trainer::TrainerEvent;
use rusty_gaze::GazeSession;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rusty_gaze=info".parse().context("bad log directive")?),
        )
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(&args.config)?;
    let session = GazeSession::new(config);
    session.init().await?;

    let predictions = session.predictions().subscribe(|estimate| {
        tracing::info!(
            "#{} gaze ({:.0}, {:.0}) loss {:.4}",
            estimate.index,
            estimate.gaze.x,
            estimate.gaze.y,
            estimate.losses.loss
        );
    });
    let training = session.trainer_events().subscribe(|event| match event {
        TrainerEvent::Loss(losses) => tracing::info!(
            "Epoch loss {:.4} (h {:.4}, v {:.4})",
            losses.loss,
            losses.h_loss,
            losses.v_loss
        ),
        TrainerEvent::Failed { message } => tracing::error!("Training stopped: {}", message),
        _ => {}
    });

    let target = SharedTarget::default();
    let source = ReplaySource::open(&args.capture, args.fps, target.clone()).await?;
    session.start_detection(source, target);
    if args.train {
        session.start_training();
    }

    match args.seconds {
        Some(secs) => {
            tokio::select! {
                collected = session.join_detection() => tracing::info!("Capture finished ({} faces)", collected),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => tracing::info!("Time limit reached"),
            }
        }
        None => {
            let collected = session.join_detection().await;
            tracing::info!("Capture finished ({} faces)", collected);
        }
    }

    session.term().await;
    if args.save && !session.save_model().await {
        tracing::warn!("Model was not saved");
    }

    predictions.unsubscribe();
    training.unsubscribe();
    Ok(())
}
