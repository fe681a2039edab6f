use anyhow::{Context, Result};
use chexprep::checkpoint::inspect_safetensors;
use chexprep::{logging, CheckpointConverter, DatasetPartitioner, PrepConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "chexprep")]
#[command(about = "Partition chest X-ray label files and convert the CheXNet checkpoint", long_about = None)]
struct Cli {
    /// Configuration file (JSON or YAML); defaults reproduce the standard data layout
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory relative paths are resolved against
    #[arg(short, long, global = true, env = "CHEXPREP_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition the label files, then convert the checkpoint
    All,

    /// Split every label CSV into train/val/test CSV and JSONL files
    Partition,

    /// Convert the legacy checkpoint and save the backbone
    Remap,

    /// List the tensors stored in a SafeTensors file
    Inspect {
        /// File to inspect
        file: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Only check that the configuration is valid
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose, cli.quiet, cli.json_logs)
        .context("Failed to initialize logging")?;

    let config = load_config(cli.config.as_deref(), &cli.data_dir)?;

    match cli.command.unwrap_or(Commands::All) {
        Commands::All => {
            let report = chexprep::run_all(&config).context("Preparation failed")?;
            info!(
                "Done: {} label files partitioned, backbone written to {}",
                report.partitions.len(),
                report.conversion.output_path.display()
            );
        }

        Commands::Partition => {
            DatasetPartitioner::new(config.partition)
                .run()
                .context("Failed to partition label files")?;
        }

        Commands::Remap => {
            let device = config.device.to_device().context("Failed to open device")?;
            CheckpointConverter::new(config.checkpoint, device)
                .context("Invalid checkpoint configuration")?
                .convert()
                .context("Failed to convert checkpoint")?;
        }

        Commands::Inspect { file } => {
            let tensors = inspect_safetensors(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            for tensor in &tensors {
                println!("{}\t{}\t{:?}", tensor.name, tensor.dtype, tensor.shape);
            }
            println!("{} tensors", tensors.len());
        }

        Commands::Config { validate } => {
            if validate {
                info!("Configuration is valid");
            } else {
                println!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<PrepConfig> {
    let mut config = match path {
        Some(path) => PrepConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => PrepConfig::default(),
    };
    config.resolve_paths(data_dir);
    Ok(config)
}
