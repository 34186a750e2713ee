//! Thin CLI over the library: install a release, inspect a model, run
//! capability detection, or hold a server up for manual use.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use llamactl::config::ServerConfig;
use llamactl::detect::Detector;
use llamactl::error::{Error, Result};
use llamactl::installation::Installation;
use llamactl::model_file::ModelFileInfo;
use llamactl::server::LlamaServer;
use llamactl::setup::Installer;

#[derive(Parser)]
#[command(name = "llamactl")]
#[command(version, about = "Manage and profile a local llama-server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a llama.cpp release build into a directory
    Install {
        /// Installation directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Release build number, e.g. 7966
        #[arg(short, long)]
        build: u64,
    },
    /// Print size, hash and GGUF metadata of a model file as JSON
    Inspect {
        /// Path to a .gguf file
        model: PathBuf,
    },
    /// Probe and benchmark working configurations for a model
    Detect {
        /// Directory containing llama-server and llama-cli
        #[arg(short, long)]
        install_dir: PathBuf,
        /// Path to a .gguf file
        model: PathBuf,
    },
    /// Start a server and keep it running until interrupted
    Run {
        /// Directory containing llama-server and llama-cli
        #[arg(short, long)]
        install_dir: PathBuf,
        /// Path to a .gguf file
        model: PathBuf,
        /// Context size in tokens
        #[arg(long)]
        ctx_size: Option<u32>,
        /// Layers to offload to the GPU (999 for all)
        #[arg(long)]
        gpu_layers: Option<u32>,
    },
}

fn locate(install_dir: &PathBuf) -> Result<Installation> {
    Installation::detect(install_dir).ok_or_else(|| {
        Error::NotFound(format!(
            "no llama.cpp installation under {}",
            install_dir.display()
        ))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Install { dir, build } => {
            let install = Installer::new()?.install(&dir, build).await?;
            println!(
                "installed build {} at {}",
                install.build_version().await?,
                install.root().display()
            );
        }
        Commands::Inspect { model } => {
            let info = ModelFileInfo::inspect(&model).await?;
            println!("{}", serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?);
        }
        Commands::Detect { install_dir, model } => {
            let install = locate(&install_dir)?;
            let result = Detector::new(install).detect(&model).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result).map_err(std::io::Error::other)?
            );
        }
        Commands::Run {
            install_dir,
            model,
            ctx_size,
            gpu_layers,
        } => {
            let install = locate(&install_dir)?;
            let mut config = ServerConfig::for_model(model);
            config.context_size = ctx_size;
            config.gpu_layers = gpu_layers;
            let mut server = LlamaServer::new(install, config);
            server.start().await?;
            if let Some(port) = server.port() {
                println!("llama-server listening on http://localhost:{port} (ctrl-c to stop)");
            }
            tokio::signal::ctrl_c().await?;
            server.stop(false).await?;
        }
    }
    Ok(())
}
