#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn::prelude::*;
use clap::Parser;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use heatmap_landmarks::config::AppConfig;
use heatmap_landmarks::data::{
    CyclingLoader, Image, InMemorySource, LandmarkDataset, PolicyAugmenter, SourceSample,
};
use heatmap_landmarks::heatmap::{ImageSize, Point2};
use heatmap_landmarks::training::{LogSink, Trainer};

type TrainBackend = Autodiff<Wgpu>;

/// Train a heatmap landmark localisation network.
#[derive(Parser)]
#[command(name = "train", about = "Train a heatmap landmark localisation network")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Resume from the latest checkpoint, or from the given checkpoint directory
    #[arg(long)]
    resume: Option<Option<PathBuf>>,

    /// Override the maximum number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the base learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Cross-validation fold recorded in checkpoints
    #[arg(long)]
    fold: Option<usize>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Synthetic samples generated per split
    #[arg(long, default_value_t = 16)]
    demo_samples: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    if let Some(epochs) = cli.epochs {
        app_config.solver.max_epochs = epochs;
    }
    if let Some(lr) = cli.lr {
        app_config.solver.base_lr = lr;
    }
    if let Some(fold) = cli.fold {
        app_config.dataset.fold = Some(fold);
        app_config.checkpoint.checkpoint_dir =
            app_config.checkpoint.checkpoint_dir.join(format!("fold_{fold}"));
    }
    app_config
        .validate()
        .context("validating configuration overrides")?;

    if cli.print_config {
        println!("{}", app_config.to_toml().context("serializing configuration")?);
        return Ok(());
    }

    let device: <TrainBackend as Backend>::Device = Default::default();
    let descriptor = app_config.descriptor();
    let seed = app_config.sampler.seed;

    let mut train_set = LandmarkDataset::new(
        Box::new(demo_source(&app_config, cli.demo_samples, seed)),
        descriptor.clone(),
    );
    if let Some(strategy) = app_config.sampler.data_augmentation {
        let augmenter = PolicyAugmenter::from_strategy(strategy, descriptor.input_size)
            .with_context(|| format!("building augmenter for {strategy}"))?;
        info!("augmentation: {strategy}");
        train_set = train_set.with_augmenter(Box::new(augmenter));
    }
    let valid_set = LandmarkDataset::new(
        Box::new(demo_source(&app_config, cli.demo_samples, seed.wrapping_add(1))),
        descriptor,
    );

    let batch_size = app_config.solver.batch_size;
    let train_loader = CyclingLoader::new(train_set, batch_size, app_config.sampler.shuffle, seed)
        .context("creating training loader")?;
    let valid_loader = CyclingLoader::new(valid_set, batch_size, false, seed)
        .context("creating validation loader")?;

    let network = app_config.network_config().init::<TrainBackend>(&device);
    let mut trainer = Trainer::new(
        app_config.trainer_config(),
        network,
        &app_config.initial_sigmas(),
        train_loader,
        valid_loader,
        device,
    )
    .context("initialising trainer")?;

    match cli.resume {
        Some(Some(dir)) => {
            trainer
                .resume(Some(&dir))
                .with_context(|| format!("resuming from {}", dir.display()))?;
        }
        Some(None) => {
            if let Err(e) = trainer.resume(None) {
                warn!("no checkpoint to resume from ({e}), starting fresh");
            }
        }
        None => {}
    }

    let state = trainer.train(&mut LogSink).context("training")?;
    info!(
        "finished after {} epochs ({:?}): best valid loss {:.5} @ {}, best coord error {:.3} px @ {}",
        state.epoch,
        state.stop_reason,
        state.best_valid_loss,
        state.best_valid_epoch,
        state.best_valid_coord_error,
        state.best_valid_coords_epoch
    );
    Ok(())
}

/// Synthetic split: dark images with a small bright blob under every
/// landmark, landmarks given in original-resolution pixels.
fn demo_source(config: &AppConfig, count: usize, seed: u64) -> InMemorySource {
    let input = config.sampler.input_size;
    let original = config.dataset.original_size;
    let num_landmarks = config.dataset.landmarks.iter().max().map_or(0, |&m| m + 1);
    let margin = 4.min(input.width / 4).min(input.height / 4);
    let mut rng = StdRng::seed_from_u64(seed);

    let samples = (0..count)
        .map(|i| {
            let mut image = Image::zeros(input);
            let landmarks = (0..num_landmarks)
                .map(|_| {
                    let x = rng.random_range(margin..input.width - margin);
                    let y = rng.random_range(margin..input.height - margin);
                    draw_blob(&mut image, x, y);
                    Point2::new(
                        x as f32 * original.width as f32 / input.width as f32,
                        y as f32 * original.height as f32 / input.height as f32,
                    )
                })
                .collect();
            SourceSample {
                id: format!("demo_{i:04}"),
                image,
                landmarks,
            }
        })
        .collect();
    InMemorySource::new(samples)
}

fn draw_blob(image: &mut Image, cx: usize, cy: usize) {
    let ImageSize { height, width } = image.size();
    for y in cy.saturating_sub(2)..(cy + 3).min(height) {
        for x in cx.saturating_sub(2)..(cx + 3).min(width) {
            let d2 = (x as f32 - cx as f32).powi(2) + (y as f32 - cy as f32).powi(2);
            let v = (-d2 / 2.0).exp();
            image.put(x, y, image.get(x, y).max(v));
        }
    }
}
