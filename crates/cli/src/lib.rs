//! stconv command implementations
//!
//! Argument types and command bodies shared by the `stconv` binary and the
//! single-purpose `gpt-neox-convert` / `rwkv-convert` binaries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stconv_model::{
    convert_file, default_output_path, inspect_safetensors, ConversionReport, GptNeoX,
    GptNeoXConfig, GptNeoXOptions, Precision, Rwkv, RwkvOptions, SafetensorsSummary,
};

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "stconv_model=info,stconv_cli=info";

/// Arguments shared by every converter
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Source checkpoint (.pth, .pt, .bin or .safetensors)
    pub src_file: PathBuf,

    /// Target data type for all matrices (f32 or f16)
    #[arg(long, default_value_t = Precision::F32)]
    pub mtype: Precision,

    /// Output file [default: source name with a .safetensors extension]
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl ConvertArgs {
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.src_file))
    }
}

/// Convert a GPT-NeoX PyTorch checkpoint to a .safetensors file with the same name
#[derive(Args, Debug, Clone)]
pub struct GptNeoXArgs {
    #[command(flatten)]
    pub convert: ConvertArgs,

    /// HuggingFace config.json providing num_attention_heads and rotary_pct
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl GptNeoXArgs {
    pub fn options(&self) -> Result<GptNeoXOptions> {
        let precision = self.convert.mtype;
        match &self.config {
            Some(path) => {
                let config = GptNeoXConfig::from_json_file(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(GptNeoXOptions::from_config(&config, precision)?)
            }
            None => Ok(GptNeoXOptions {
                precision,
                ..Default::default()
            }),
        }
    }
}

/// Convert a RWKV PyTorch checkpoint to a .safetensors file with the same name
#[derive(Args, Debug, Clone)]
pub struct RwkvArgs {
    #[command(flatten)]
    pub convert: ConvertArgs,

    /// Fold blocks.0.ln0 into emb.weight and drop it
    #[arg(long)]
    pub fold_ln0: bool,

    /// Epsilon used when folding ln0
    #[arg(long, default_value_t = 1e-5)]
    pub ln_eps: f32,
}

impl RwkvArgs {
    pub fn options(&self) -> RwkvOptions {
        RwkvOptions {
            precision: self.convert.mtype,
            fold_ln0: self.fold_ln0,
            ln_eps: self.ln_eps,
        }
    }
}

/// Print the tensors and metadata of a .safetensors file
#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// File to inspect
    pub file: PathBuf,
}

/// Install the tracing subscriber (stderr, `RUST_LOG` aware)
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

pub fn run_gpt_neox(args: &GptNeoXArgs) -> Result<ConversionReport> {
    let options = args.options()?;
    tracing::debug!("GPT-NeoX options: {:?}", options);

    let output = args.convert.output_path();
    let report = convert_file(&GptNeoX::new(options), &args.convert.src_file, &output)
        .with_context(|| format!("converting {}", args.convert.src_file.display()))?;
    print_report(&report);
    Ok(report)
}

pub fn run_rwkv(args: &RwkvArgs) -> Result<ConversionReport> {
    let output = args.convert.output_path();
    let report = convert_file(&Rwkv::new(args.options()), &args.convert.src_file, &output)
        .with_context(|| format!("converting {}", args.convert.src_file.display()))?;
    print_report(&report);
    Ok(report)
}

pub fn run_inspect(args: &InspectArgs) -> Result<SafetensorsSummary> {
    let summary = inspect_safetensors(&args.file)
        .with_context(|| format!("inspecting {}", args.file.display()))?;
    print_summary(&args.file, &summary);
    Ok(summary)
}

fn print_report(report: &ConversionReport) {
    for tensor in &report.tensors {
        println!("{}", tensor);
    }
    let mut metadata: Vec<_> = report.metadata.iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        println!("{}: {}", key, value);
    }
    println!("Saved {} tensors to {}", report.tensors.len(), report.output.display());
}

fn print_summary(path: &Path, summary: &SafetensorsSummary) {
    println!("{}", path.display());
    for tensor in &summary.tensors {
        println!("{}", tensor);
    }
    if let Some(metadata) = &summary.metadata {
        let mut entries: Vec<_> = metadata.iter().collect();
        entries.sort();
        for (key, value) in entries {
            println!("{}: {}", key, value);
        }
    }
}
