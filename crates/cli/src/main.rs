//! stconv CLI
//!
//! Converts PyTorch checkpoints to safetensors files the ggml runtime can
//! memory-map.
//!
//! # Usage
//!
//! ```bash
//! # GPT-NeoX (Pythia) with f16 matrices
//! stconv gpt-neox pythia-160m/pytorch_model.bin --mtype f16 --config pythia-160m/config.json
//!
//! # RWKV, folding the first layer norm into the embedding
//! stconv rwkv RWKV-4-Pile-169M-20220807-8023.pth --fold-ln0
//!
//! # Show what was written
//! stconv inspect RWKV-4-Pile-169M-20220807-8023.safetensors
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

use stconv_cli::{init_tracing, run_gpt_neox, run_inspect, run_rwkv, GptNeoXArgs, InspectArgs, RwkvArgs};

#[derive(Parser)]
#[command(name = "stconv")]
#[command(version)]
#[command(about = "Convert GPT-NeoX and RWKV PyTorch checkpoints to safetensors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a GPT-NeoX checkpoint
    GptNeox(GptNeoXArgs),

    /// Convert a RWKV checkpoint
    Rwkv(RwkvArgs),

    /// Print the tensors and metadata of a .safetensors file
    Inspect(InspectArgs),
}

fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Commands::GptNeox(args) => {
            run_gpt_neox(&args)?;
        }
        Commands::Rwkv(args) => {
            run_rwkv(&args)?;
        }
        Commands::Inspect(args) => {
            run_inspect(&args)?;
        }
    }

    Ok(())
}
