use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use pipeshard_cli::commands::{self, ConvertArgs, ReshardArgs};
use pipeshard_cli::config::CliConfig;
use pipeshard_cli::logging::{self, LogFormat};
use pipeshard_core::checkpoint::Convention;
use pipeshard_core::config::{ModelConfig, Precision};
use pipeshard_core::storage::StorageProtocol;

#[derive(Parser)]
#[command(
    name = "pipeshard",
    about = "Convert and reshard LLaMA checkpoints for pipeline-parallel stages"
)]
struct Cli {
    /// Config file to use instead of ~/.config/pipeshard/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. "debug")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// How the model shape is chosen.
#[derive(Args, Clone, Default)]
struct ModelArgs {
    /// Model preset (7b, 13b, 30b)
    #[arg(long)]
    model: Option<String>,

    /// Path to a config.json with the model shape
    #[arg(long)]
    model_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a checkpoint between conventions in one process
    Convert {
        /// Directory holding the source checkpoint
        #[arg(long)]
        source: PathBuf,

        /// Source convention (community, reference, native)
        #[arg(long)]
        from: Convention,

        /// Destination directory (or bucket with --storage s3)
        #[arg(long)]
        dest: PathBuf,

        /// Destination convention
        #[arg(long)]
        to: Convention,

        #[command(flatten)]
        model: ModelArgs,

        /// Cast weights to this precision (fp32, fp16, bf16)
        #[arg(long)]
        precision: Option<Precision>,

        /// Destination storage (file, s3); s3 keeps objects in memory
        #[arg(long)]
        storage: Option<StorageProtocol>,
    },

    /// Split a checkpoint into stage shards and merge it back, one thread
    /// per stage
    Reshard {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        from: Convention,

        #[arg(long)]
        dest: PathBuf,

        #[arg(long)]
        to: Convention,

        #[command(flatten)]
        model: ModelArgs,

        /// Number of pipeline stages
        #[arg(long)]
        stages: Option<usize>,

        /// Directory staging areas are created in
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        #[arg(long)]
        storage: Option<StorageProtocol>,
    },

    /// Print which layers each pipeline stage owns
    Partition {
        /// Total decoder layers; defaults to the model's layer count
        #[arg(long)]
        layers: Option<usize>,

        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        stages: Option<usize>,
    },

    /// List the canonical keys, shapes and dtypes of a checkpoint
    Inspect {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        convention: Convention,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Store defaults in the config file
    SaveConfig {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        precision: Option<Precision>,

        #[arg(long)]
        stages: Option<usize>,

        #[arg(long)]
        micro_batches: Option<usize>,

        #[arg(long)]
        staging_dir: Option<PathBuf>,

        #[arg(long)]
        storage: Option<StorageProtocol>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CliConfig> {
    match path {
        Some(path) => CliConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(CliConfig::load()),
    }
}

fn model_config(
    args: &ModelArgs,
    file: &CliConfig,
    source: Option<&std::path::Path>,
) -> anyhow::Result<ModelConfig> {
    let path = args.model_config.as_ref().or(file.model_config.as_ref());
    let preset = args.model.as_ref().or(file.model.as_ref());
    commands::resolve_model_config(path.map(|p| p.as_path()), preset.map(|s| s.as_str()), source)
}

fn storage_protocol(flag: Option<StorageProtocol>, file: &CliConfig) -> anyhow::Result<StorageProtocol> {
    match (flag, &file.storage) {
        (Some(protocol), _) => Ok(protocol),
        (None, Some(name)) => Ok(name.parse()?),
        (None, None) => Ok(StorageProtocol::File),
    }
}

fn num_stages(flag: Option<usize>, file: &CliConfig) -> usize {
    flag.or(file.num_stages).unwrap_or(1)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file = load_config(cli.config.as_ref())?;

    let level = cli.log_level.clone().or_else(|| file.log_level.clone());
    logging::init(level.as_deref(), LogFormat::from_env())?;

    match cli.command {
        Command::Convert {
            source,
            from,
            dest,
            to,
            model,
            precision,
            storage,
        } => {
            let model = model_config(&model, &file, Some(&source))?;
            let precision = match (precision, &file.precision) {
                (Some(p), _) => Some(p),
                (None, Some(name)) => Some(name.parse()?),
                (None, None) => None,
            };
            let dest_storage = commands::open_storage(storage_protocol(storage, &file)?, &dest);
            let written = commands::convert(ConvertArgs {
                source: &source,
                from,
                dest: dest_storage.as_ref(),
                to,
                model,
                precision,
            })?;
            for key in written {
                println!("{}", dest_storage.describe(&key));
            }
        }
        Command::Reshard {
            source,
            from,
            dest,
            to,
            model,
            stages,
            staging_dir,
            storage,
        } => {
            let model = model_config(&model, &file, Some(&source))?;
            let staging_dir = staging_dir
                .or_else(|| file.staging_dir.clone())
                .unwrap_or_else(|| std::env::temp_dir().join("pipeshard"));
            let dest_storage = commands::open_storage(storage_protocol(storage, &file)?, &dest);
            let sizes = commands::reshard(ReshardArgs {
                source: &source,
                from,
                dest: dest_storage.as_ref(),
                to,
                model,
                num_stages: num_stages(stages, &file),
                staging_dir,
            })?;
            for (stage, size) in sizes.iter().enumerate() {
                println!("stage {stage}: {size} tensors");
            }
        }
        Command::Partition {
            layers,
            model,
            stages,
        } => {
            let total_layers = match layers {
                Some(layers) => layers,
                None => model_config(&model, &file, None)?.num_hidden_layers,
            };
            for line in commands::partition(total_layers, num_stages(stages, &file))? {
                println!("{line}");
            }
        }
        Command::Inspect {
            source,
            convention,
            model,
        } => {
            let model = model_config(&model, &file, Some(&source))?;
            for tensor in commands::inspect(&source, convention, model)? {
                println!("{:<24} {:?} {:?}", tensor.key.to_string(), tensor.shape, tensor.dtype);
            }
        }
        Command::SaveConfig {
            model,
            precision,
            stages,
            micro_batches,
            staging_dir,
            storage,
        } => {
            let mut merged = file;
            merged.merge(&CliConfig {
                model: model.model,
                model_config: model.model_config,
                precision: precision.map(|p| p.to_string()),
                num_stages: stages,
                micro_batch_num: micro_batches,
                staging_dir,
                storage: storage.map(|s| s.to_string()),
                log_level: cli.log_level,
            });
            let path = match cli.config {
                Some(path) => {
                    merged.save_to(&path)?;
                    path
                }
                None => merged.save()?,
            };
            println!("saved {}", path.display());
        }
    }
    Ok(())
}
