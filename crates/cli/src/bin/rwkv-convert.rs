//! Convert a RWKV PyTorch checkpoint to a .safetensors file with the same name

use clap::Parser;

use stconv_cli::{init_tracing, run_rwkv, RwkvArgs};

#[derive(Parser)]
#[command(name = "rwkv-convert", version)]
struct Cli {
    #[command(flatten)]
    args: RwkvArgs,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    run_rwkv(&Cli::parse().args)?;
    Ok(())
}
