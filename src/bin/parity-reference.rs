//! parity-reference: Generate (or re-check) the reference embedding fixture.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;

use embed_parity::backend::{EmbeddingOptions, ExecutionProvider};
use embed_parity::cli;
use embed_parity::engine::reference::{
    verify_against, Mismatch, ReferenceSet, ReferenceSetBuilder, DEFAULT_CORPUS,
    DEFAULT_SIMILARITY_THRESHOLD,
};
use embed_parity::PaddingSide;

#[derive(Parser)]
#[command(
    name = "parity-reference",
    about = "Generate reference embeddings for cross-runtime parity tests"
)]
struct Args {
    /// Embedding model directory (default: <repo>/models/qwen3-embedding/model)
    #[arg(long)]
    model: Option<PathBuf>,

    /// Output JSON file (default: the .NET test suite's TestData fixture)
    #[arg(short = 'o', long, conflicts_with = "verify")]
    output: Option<PathBuf>,

    /// Execution provider
    #[arg(short = 'e', long, value_enum, default_value_t = ExecutionProvider::Cpu)]
    execution_provider: ExecutionProvider,

    /// Tokenizer padding side; selects the pooling rule
    #[arg(long, value_enum, default_value_t = PaddingSide::Left)]
    padding_side: PaddingSide,

    /// Maximum tokens per text before truncation
    #[arg(long, default_value = "8192")]
    max_length: usize,

    /// Compare against an existing reference file instead of writing one
    #[arg(long)]
    verify: Option<PathBuf>,

    /// Minimum cosine similarity accepted by --verify
    #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
    threshold: f64,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let model_dir = cli::resolve_path(args.model, cli::default_embedding_model_dir)?;
    let options = EmbeddingOptions {
        max_length: args.max_length,
        padding_side: args.padding_side,
    };

    let start = Instant::now();
    let mut encoder = cli::backend::load_encoder(&model_dir, args.execution_provider, options)?;
    let set = ReferenceSetBuilder::new(&mut encoder).build_with_progress(
        DEFAULT_CORPUS,
        |done, total| println!("Generating embedding {}/{}...", done + 1, total),
    )?;
    let elapsed = start.elapsed().as_secs_f64();

    let dimension = set.dimension().unwrap_or(0);
    println!("Generated {} embeddings in {:.1}s", set.len(), elapsed);
    println!("Embedding dimension: {}", dimension);

    if let Some(reference_path) = args.verify {
        let reference = ReferenceSet::load(&reference_path)?;
        let report = verify_against(&reference, &set, args.threshold);
        for mismatch in &report.mismatches {
            match mismatch {
                Mismatch::Missing { text } => println!("  missing: {:?}", text),
                Mismatch::Dimension {
                    text,
                    expected,
                    actual,
                } => println!("  dimension {} != {}: {:?}", actual, expected, text),
                Mismatch::Similarity { text, similarity } => {
                    println!("  similarity {:.6}: {:?}", similarity, text)
                }
            }
        }
        if !report.passed() {
            return Err(format!(
                "{} of {} reference texts below threshold {}",
                report.mismatches.len(),
                report.checked,
                report.threshold
            )
            .into());
        }
        println!(
            "All {} reference texts match (threshold {})",
            report.checked, report.threshold
        );
        return Ok(());
    }

    let output = cli::resolve_path(args.output, cli::default_reference_output)?;
    set.write(&output)?;
    println!("Saved to: {}", output.display());
    Ok(())
}
