use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fprint::config::{self, Config};
use fprint::coordinator::label;
use fprint::{Capture, Captured, Coordinator, DescriptorStore, Outcome};
use fprint_vision::{Camera, FileCapture};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "fprint")]
#[command(version, about = "Offline fingerprint enrollment and verification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a fingerprint
    Enroll {
        /// Read the capture from an image file instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Match a fingerprint against every enrolled one
    Verify {
        /// Read the capture from an image file instead of the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Print the decision and distance report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List enrolled fingerprints
    List,
    /// Delete an enrolled fingerprint; later ones are renumbered
    Delete {
        /// Fingerprint number as shown by `list`
        position: usize,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Open config file in editor
    Config,
}

/// Camera behind an Enter-to-capture prompt; `q` cancels.
struct PromptedCamera {
    camera: Camera,
}

impl Capture for PromptedCamera {
    fn capture(&mut self) -> Result<Captured> {
        eprint!("Place your fingertip inside the guide and press Enter (q to cancel): ");
        io::stderr().flush().ok();
        if prompt_line()?.eq_ignore_ascii_case("q") {
            return Ok(Captured::Cancelled);
        }
        self.camera.capture()
    }
}

fn prompt_line() -> Result<String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading from stdin")?;
    Ok(line.trim().to_string())
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(None)?;

    match cli.command {
        Commands::Enroll { image } => enroll(&cfg, image),
        Commands::Verify { image, json } => verify(&cfg, image, json),
        Commands::List => list(&cfg),
        Commands::Delete { position, yes } => delete(&cfg, position, yes),
        Commands::Config => open_config(),
    }
}

fn capture_source(cfg: &Config, image: Option<PathBuf>) -> Result<Box<dyn Capture>> {
    Ok(match image {
        Some(path) => Box::new(FileCapture::new(path)),
        None => {
            info!("Opening camera: {}", cfg.camera);
            let camera =
                Camera::open(&cfg.camera, cfg.warmup_frames).context("Failed to open camera")?;
            Box::new(PromptedCamera { camera })
        }
    })
}

fn enroll(cfg: &Config, image: Option<PathBuf>) -> Result<()> {
    let coordinator = Coordinator::from_config(cfg);
    if let Some(e) = coordinator.model_error() {
        anyhow::bail!("Cannot enroll: {}", e);
    }
    let mut source = capture_source(cfg, image)?;

    let outcome = coordinator.enroll(source.as_mut())?.wait();
    report(&outcome)
}

fn verify(cfg: &Config, image: Option<PathBuf>, json: bool) -> Result<()> {
    let coordinator = Coordinator::from_config(cfg);
    if let Some(e) = coordinator.model_error() {
        anyhow::bail!("Cannot verify: {}", e);
    }
    let mut source = capture_source(cfg, image)?;

    let outcome = coordinator.verify(source.as_mut())?.wait();
    if let Outcome::Verified { decision, warning } = &outcome {
        if let Some(w) = warning {
            warn!("{}", w);
        }
        if json {
            println!("{}", serde_json::to_string_pretty(decision)?);
        } else {
            println!("{}", decision);
        }
        if !decision.is_match() {
            anyhow::bail!("Verification failed: no matching fingerprint");
        }
        return Ok(());
    }
    report(&outcome)
}

fn list(cfg: &Config) -> Result<()> {
    let coordinator =
        Coordinator::store_only(DescriptorStore::open(cfg.store_path()), cfg.threshold);
    let loaded = coordinator.enrolled();
    if let Some(w) = &loaded.warning {
        warn!("{}", w);
    }
    if loaded.descriptors.is_empty() {
        info!("No fingerprints enrolled");
    }
    for identity in 1..=loaded.descriptors.len() {
        println!("{}", label(identity));
    }
    Ok(())
}

fn delete(cfg: &Config, position: usize, yes: bool) -> Result<()> {
    let coordinator =
        Coordinator::store_only(DescriptorStore::open(cfg.store_path()), cfg.threshold);

    let mut confirm = |position: usize| {
        if yes {
            return true;
        }
        eprint!("Delete {}? [y/N] ", label(position));
        io::stderr().flush().ok();
        matches!(prompt_line().as_deref(), Ok("y") | Ok("Y") | Ok("yes"))
    };
    let outcome = coordinator.delete(position, &mut confirm)?.wait();
    report(&outcome)
}

fn report(outcome: &Outcome) -> Result<()> {
    match outcome {
        Outcome::Failed { .. } => anyhow::bail!("{}", outcome),
        _ => {
            info!("{}", outcome);
            Ok(())
        }
    }
}

fn open_config() -> Result<()> {
    let config_path = config::CONFIG_PATH.as_path();
    if !config_path.exists() {
        config::save_config(&Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
