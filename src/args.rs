use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (created with defaults when missing)
    #[arg(short, long, default_value = rusty_gaze::config::AppConfig::PATH)]
    pub config: PathBuf,

    /// JSON-lines landmark capture to replay
    #[arg(long)]
    pub capture: PathBuf,

    /// Replay rate; 0 replays as fast as possible
    #[arg(long, default_value_t = 30.0)]
    pub fps: f32,

    /// Train on targeted frames while replaying
    #[arg(long, default_value_t = false)]
    pub train: bool,

    /// Stop after this many seconds even if the capture has frames left
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Save the model to the store on exit
    #[arg(long, default_value_t = false)]
    pub save: bool,
}
