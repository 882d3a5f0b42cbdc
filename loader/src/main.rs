//! ckpt-loader - Command Line Interface
//!
//! Reassembles a tensor/pipeline/expert-parallel checkpoint into one ordered
//! stream of merged tensors.
//!
//! ## Commands
//!
//! - `load` - Stream a checkpoint directory into a CBOR stream file, or log a
//!   summary of every message when no output is given
//! - `fabricate` - Write a deterministic synthetic checkpoint for testing

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use loader::{
    channel, drain, init_production_logging, init_simple_logging, load_checkpoint,
    write_checkpoint, CborShardProvider, CborStreamSink, LoaderConfig, MockModelConfig,
    MockShardProvider, ModelKind, PositionEmbeddingType, ReplicaPolicy, Sink, SummarySink,
    TransformerImpl,
};
use std::path::PathBuf;
use tracing::{error, info};

/// Sharded checkpoint loader
#[derive(Parser, Debug)]
#[command(name = "ckpt-loader")]
#[command(about = "Reassemble sharded model checkpoints into one tensor stream", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a checkpoint directory
    Load(LoadArgs),

    /// Write a synthetic checkpoint directory
    Fabricate(FabricateArgs),
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Checkpoint directory (holds args.cbor and mp_rank_* shards)
    #[arg(long)]
    load_dir: PathBuf,

    /// Loader configuration file (default: ~/.ckpt-loader/loader.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the stream to this file as CBOR frames
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Model type to read the checkpoint as (GPT or BERT)
    #[arg(long)]
    model_type: Option<ModelKind>,

    /// Checkpoint uses reference (unfused) transformer layers
    #[arg(long)]
    local_impl: bool,

    /// Checkpoint uses rotary position embeddings
    #[arg(long)]
    rope: bool,

    /// Original size of the vocabulary, without padding
    #[arg(long)]
    true_vocab_size: Option<usize>,

    /// JSON vocabulary file used to compute the true vocabulary size
    #[arg(long)]
    vocab_file: Option<PathBuf>,

    /// Emit logits for a fabricated batch after the model tensors
    #[arg(long)]
    test_logits: bool,

    /// Fail when tensor-parallel copies of replicated parameters differ
    #[arg(long)]
    verify_replicas: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rotating log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FabricateArgs {
    /// Output checkpoint directory
    #[arg(long)]
    out: PathBuf,

    /// Tensor-parallel size
    #[arg(long, default_value_t = 1)]
    tp: usize,

    /// Pipeline-parallel size
    #[arg(long, default_value_t = 1)]
    pp: usize,

    /// Virtual-pipeline size
    #[arg(long)]
    vp: Option<usize>,

    /// Number of transformer layers
    #[arg(long, default_value_t = 4)]
    layers: usize,

    /// Hidden size
    #[arg(long, default_value_t = 8)]
    hidden: usize,

    /// MLP hidden size
    #[arg(long, default_value_t = 16)]
    ffn: usize,

    /// Attention heads
    #[arg(long, default_value_t = 2)]
    heads: usize,

    /// Padded vocabulary size
    #[arg(long, default_value_t = 32)]
    vocab: usize,

    /// Number of experts (0 = dense)
    #[arg(long, default_value_t = 0)]
    experts: usize,

    /// Expert-parallel size
    #[arg(long, default_value_t = 1)]
    ep: usize,

    /// GPT or BERT
    #[arg(long, default_value = "GPT")]
    model_type: ModelKind,

    /// Gated (SwiGLU) MLP
    #[arg(long)]
    swiglu: bool,

    /// Separate output layer instead of tied embeddings
    #[arg(long)]
    untie: bool,

    /// BERT binary classification head
    #[arg(long)]
    binary_head: bool,

    /// Weight generator seed
    #[arg(long, default_value_t = 12345)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Load(args) => {
            match &args.log_dir {
                Some(dir) => init_production_logging(&args.log_level, Some(dir.clone()))?,
                None => init_simple_logging(&args.log_level)?,
            }
            cmd_load(args).await?;
        }

        Commands::Fabricate(args) => {
            init_simple_logging("info")?;
            cmd_fabricate(args).await?;
        }
    }

    Ok(())
}

/// Configuration file (explicit, or the default path when it exists) with
/// command-line overrides applied
fn resolve_config(args: &LoadArgs) -> Result<LoaderConfig> {
    let mut config = match &args.config {
        Some(path) => LoaderConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let default = LoaderConfig::default_path()?;
            if default.exists() {
                LoaderConfig::load(&default)?
            } else {
                LoaderConfig::default()
            }
        }
    };

    if let Some(model_type) = args.model_type {
        config.model_type = model_type;
    }
    if args.local_impl {
        config.transformer_impl = TransformerImpl::Local;
    }
    if args.rope {
        config.position_embedding_type = PositionEmbeddingType::Rope;
    }
    if args.true_vocab_size.is_some() {
        config.true_vocab_size = args.true_vocab_size;
    }
    if args.vocab_file.is_some() {
        config.vocab_file = args.vocab_file.clone();
    }
    config.test_logits |= args.test_logits;
    if args.verify_replicas {
        config.replica_policy = ReplicaPolicy::Verify;
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_load(args: LoadArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let provider = CborShardProvider::open(&args.load_dir)?;
    info!(
        root = %provider.root().display(),
        model_type = %config.model_type,
        policy = ?config.replica_policy,
        "Opened checkpoint"
    );

    let mut sink: Box<dyn Sink> = match &args.output {
        Some(path) => Box::new(CborStreamSink::create(path).await?),
        None => Box::new(SummarySink),
    };

    let (tx, mut rx) = channel(config.channel_capacity);
    let producer_config = config.clone();
    let producer =
        tokio::spawn(async move { load_checkpoint(&provider, &producer_config, &tx).await });

    let drained = drain(&mut rx, sink.as_mut()).await;
    // unblock the producer if the sink gave up early
    drop(rx);
    let produced = producer.await.context("Loader task panicked")?;

    if let Err(e) = produced {
        error!(error = %e, "Checkpoint load failed");
        return Err(e).context("Failed to load checkpoint");
    }
    let summary = drained.context("Stream did not complete")?;

    info!(
        messages = summary.messages,
        tensors = summary.tensors,
        bytes = summary.bytes,
        "Checkpoint streamed"
    );
    println!(
        "✅ Streamed {} messages ({} tensors, {} bytes)",
        summary.messages, summary.tensors, summary.bytes
    );
    if let Some(path) = &args.output {
        println!("   Output: {}", path.display());
    }

    Ok(())
}

async fn cmd_fabricate(args: FabricateArgs) -> Result<()> {
    let config = MockModelConfig {
        model_type: args.model_type,
        num_layers: args.layers,
        hidden_size: args.hidden,
        ffn_hidden_size: args.ffn,
        num_attention_heads: args.heads,
        padded_vocab_size: args.vocab,
        tensor_parallel_size: args.tp,
        pipeline_parallel_size: args.pp,
        virtual_pipeline_parallel_size: args.vp,
        expert_parallel_size: args.ep,
        num_experts: args.experts,
        swiglu: args.swiglu,
        untie_embeddings_and_output_weights: args.untie,
        bert_binary_head: args.binary_head,
        ..Default::default()
    };

    let provider = MockShardProvider::new(config, args.seed)?;
    let coordinates = provider.coordinates();
    let written = write_checkpoint(&provider, &args.out, &coordinates)
        .await
        .with_context(|| format!("Failed to write checkpoint to {}", args.out.display()))?;

    println!("✅ Wrote {} shard files to {}", written, args.out.display());
    Ok(())
}
