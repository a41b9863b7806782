use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nano_medusa::{GenerationOutput, MedusaConfig, MedusaEngine, ModelConfig, TinyMedusaLm};

#[derive(Parser, Debug)]
#[command(name = "nano-medusa")]
#[command(about = "Compare Medusa tree decoding with greedy decoding on a seeded tiny model")]
struct Args {
    /// Prompt token ids, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "1,5,9,13")]
    prompt: Vec<u32>,

    /// Candidates per Medusa head, comma separated
    #[arg(long, value_delimiter = ',', default_value = "4,3,2")]
    top_k: Vec<usize>,

    /// Maximum tokens to generate
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Acceptance temperature (0 = greedy)
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Append the base model's bonus token every step
    #[arg(long)]
    use_base_logits: bool,

    /// Model weight seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Medusa config JSON; overrides the decoding flags
    #[arg(long)]
    medusa_config: Option<PathBuf>,

    /// Model config JSON; overrides the seed
    #[arg(long)]
    model_config: Option<PathBuf>,
}

fn report(label: &str, output: &GenerationOutput, elapsed_ms: u128) {
    println!(
        "{label:>7}: {} tokens in {} steps ({elapsed_ms} ms), finish {:?}",
        output.output_tokens.len(),
        output.stats.steps,
        output.finish_reason
    );
    println!("         {:?}", output.output_tokens);
}

fn main() -> nano_medusa::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let model_config = match &args.model_config {
        Some(path) => ModelConfig::from_file(path)?,
        None => ModelConfig::default().seed(args.seed),
    };
    let medusa_config = match &args.medusa_config {
        Some(path) => MedusaConfig::from_file(path)?,
        None => MedusaConfig::new(args.top_k.clone())
            .temperature(args.temperature)
            .use_base_logits(args.use_base_logits)
            .max_new_tokens(args.max_tokens),
    };

    println!("nano-medusa v{}", env!("CARGO_PKG_VERSION"));

    let device = Device::Cpu;
    let model = TinyMedusaLm::new(model_config, DType::F32, &device)?;
    let mut engine = MedusaEngine::new(medusa_config)?;
    println!(
        "Tree: {} nodes, {} paths",
        engine.topology().node_count(),
        engine.topology().num_paths()
    );

    let start = Instant::now();
    let greedy = engine.generate_greedy(&model, &args.prompt)?;
    report("greedy", &greedy, start.elapsed().as_millis());

    let start = Instant::now();
    let medusa = engine.generate(&model, &args.prompt)?;
    report("medusa", &medusa, start.elapsed().as_millis());

    println!(
        "Mean accept length {:.2}, {:.2} tokens per step, outputs {}",
        medusa.stats.mean_accept_length(),
        medusa.stats.tokens_per_step(),
        if medusa.output_tokens == greedy.output_tokens { "match" } else { "differ" }
    );
    Ok(())
}
