use anyhow::{Context, Result};
use candle_core::Tensor;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use treeseg::config::DeviceType;
use treeseg::training::checkpoints::load_model;
use treeseg::{Config, Detector, MaskRcnn, Trainer};

#[derive(Parser)]
#[command(name = "treeseg")]
#[command(about = "Train Mask R-CNN style instance segmentation models on COCO datasets", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a detector
    Train {
        /// Configuration file; TREESEG__* environment variables override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// COCO annotation file
        #[arg(long)]
        coco: Option<PathBuf>,

        /// Directory holding the images, defaults to the annotation file's directory
        #[arg(long)]
        images: Option<PathBuf>,

        /// Stem of every output file name
        #[arg(short = 'n', long)]
        model_name: Option<String>,

        /// Number of foreground classes
        #[arg(long)]
        num_classes: Option<usize>,

        /// Samples per batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Base learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Compute device: auto, cpu, cuda[:N] or metal[:N]
        #[arg(long)]
        device: Option<String>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Checkpoint to resume from
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Hide the per-batch progress bars
        #[arg(long)]
        quiet: bool,
    },

    /// Run a trained model on one image
    Predict {
        /// Final model file (`<name>.pt`)
        #[arg(short, long)]
        model: PathBuf,

        /// Image to segment
        #[arg(short, long)]
        image: PathBuf,

        /// Compute device: auto, cpu, cuda[:N] or metal[:N]
        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// Validate a configuration file and print the resolved configuration
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show system information
    Info,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let outcome = match cli.command {
        Commands::Train {
            config,
            coco,
            images,
            model_name,
            num_classes,
            batch_size,
            lr,
            epochs,
            device,
            output,
            resume,
            quiet,
        } => load_config(config.as_deref()).and_then(|mut cfg| {
            if let Some(path) = coco {
                cfg.data.coco_path = path;
            }
            if images.is_some() {
                cfg.data.image_dir = images;
            }
            if let Some(name) = model_name {
                cfg.output.model_name = name;
            }
            if let Some(n) = num_classes {
                cfg.model.num_classes = n;
            }
            if let Some(b) = batch_size {
                cfg.training.batch_size = b;
            }
            if let Some(lr) = lr {
                cfg.optimizer.learning_rate = lr;
            }
            if let Some(e) = epochs {
                cfg.training.num_epochs = e;
            }
            if let Some(d) = device {
                cfg.training.device = d.parse::<DeviceType>()?;
            }
            if let Some(dir) = output {
                cfg.output.dir = dir;
            }
            if resume.is_some() {
                cfg.training.resume_from = resume;
            }
            train(cfg, !quiet)
        }),
        Commands::Predict {
            model,
            image,
            device,
        } => predict(model, image, &device),
        Commands::Config { file } => validate_config(file),
        Commands::Info => {
            show_system_info();
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    Config::load(path).context("Failed to load configuration")
}

fn train(config: Config, show_progress: bool) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    info!(
        "Training '{}' for {} epochs on {}",
        config.output.model_name,
        config.training.num_epochs,
        config.data.coco_path.display()
    );

    let mut trainer = Trainer::from_config(config)
        .context("Failed to set up training")?
        .with_progress(show_progress);
    let result = trainer.train().context("Training failed")?;

    info!("Epochs completed: {}", result.epochs_completed);
    if let Some(loss) = result.best_val_loss {
        info!("Best validation loss sum: {}", loss);
    }
    if let Some(path) = &result.best_checkpoint_path {
        info!("Best checkpoint: {}", path.display());
    }
    if let Some(path) = &result.model_path {
        info!("Model saved to: {}", path.display());
    }
    Ok(())
}

fn predict(model_path: PathBuf, image_path: PathBuf, device: &str) -> Result<()> {
    let device = device.parse::<DeviceType>()?.resolve()?;
    let artifact = load_model(&model_path)
        .with_context(|| format!("Failed to load model {}", model_path.display()))?;
    let mut model = MaskRcnn::from_state(artifact.config, &artifact.model_state_dict, &device)
        .context("Failed to rebuild detector")?;
    model.set_training(false);

    let img = image::open(&image_path)
        .with_context(|| format!("Failed to read image {}", image_path.display()))?
        .to_rgb8();
    let (w, h) = img.dimensions();
    let image = Tensor::from_vec(img.into_raw(), (h as usize, w as usize, 3), &device)?
        .permute((2, 0, 1))?
        .to_dtype(candle_core::DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;

    let detections = model.detect(&[image])?;
    for det in &detections {
        let boxes = det.boxes.to_vec2::<f32>()?;
        let scores = det.scores.to_vec1::<f32>()?;
        let labels = det.labels.to_vec1::<u32>()?;
        println!("{} detections", det.len());
        for ((b, s), l) in boxes.iter().zip(&scores).zip(&labels) {
            println!(
                "  label={} score={:.3} box=[{:.1}, {:.1}, {:.1}, {:.1}]",
                l, s, b[0], b[1], b[2], b[3]
            );
        }
    }
    Ok(())
}

fn validate_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path.as_deref())?;
    info!("Configuration is valid");
    print!("{}", config.to_yaml()?);
    Ok(())
}

fn show_system_info() {
    println!("TreeSeg - Mask R-CNN training pipeline");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] CUDA (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Metal (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Accelerate (not compiled)");

    println!("  [x] CPU");
    println!("  worker threads available: {}", num_cpus::get());
    println!();
    println!("Usage:");
    println!("  treeseg train --coco annotations.json -n my_model --num-classes 1");
    println!("  treeseg predict -m my_model.pt -i image.png");
    println!("  treeseg config -f treeseg.yaml");
}
