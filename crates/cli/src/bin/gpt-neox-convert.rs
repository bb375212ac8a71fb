//! Convert a GPT-NeoX PyTorch checkpoint to a .safetensors file with the same name

use clap::Parser;

use stconv_cli::{init_tracing, run_gpt_neox, GptNeoXArgs};

#[derive(Parser)]
#[command(name = "gpt-neox-convert", version)]
struct Cli {
    #[command(flatten)]
    args: GptNeoXArgs,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    run_gpt_neox(&Cli::parse().args)?;
    Ok(())
}
