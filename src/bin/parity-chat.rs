//! parity-chat: Interactive streaming chat against a causal LM.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use embed_parity::backend::{ExecutionProvider, SearchOptions};
use embed_parity::cli;
use embed_parity::engine::{CancellationToken, ChatContext, ChatLoop};

#[derive(Parser)]
#[command(name = "parity-chat", about = "Interactive streaming chat session")]
struct Args {
    /// Model directory (config.json, tokenizer.json, *.safetensors)
    #[arg(short = 'm', long)]
    model_path: PathBuf,

    /// Execution provider
    #[arg(short = 'e', long, value_enum, default_value_t = ExecutionProvider::Cpu)]
    execution_provider: ExecutionProvider,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u64>,

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
    let engine = cli::backend::load_generator(&args.model_path, args.execution_provider)?;
    let options = SearchOptions {
        seed: args.seed,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    cli::signal::install_interrupt_handler(cancel.clone())?;

    let stdin = io::stdin();
    let mut chat = ChatLoop::new(
        ChatContext::new(engine, options),
        stdin.lock(),
        io::stdout(),
        cancel,
    );
    chat.run()?;
    Ok(())
}
