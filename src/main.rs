use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;

use latticelm::{InputKind, TrainConfig, Trainer};

/// Learn a language model and a word dictionary from lattices (or text)
/// using Pitman-Yor language models and weighted finite-state
/// transducers.
#[derive(Parser, Debug)]
#[command(name = "latticelm", version, about)]
struct Args {
    /// Iterations to execute as burn-in
    #[arg(long = "burnin", default_value_t = 20)]
    burnin: usize,

    /// Annealing steps to perform (see Goldwater+ 2009)
    #[arg(long = "annealsteps", default_value_t = 5)]
    annealsteps: usize,

    /// Length of each annealing step in iterations
    #[arg(long = "anneallength", default_value_t = 3)]
    anneallength: usize,

    /// Number of samples to take
    #[arg(long = "samps", default_value_t = 100)]
    samps: usize,

    /// Iterations between samples once burned in
    #[arg(long = "samprate", default_value_t = 1)]
    samprate: usize,

    /// N-gram length of the word language model
    #[arg(long = "knownn", default_value_t = 3)]
    knownn: usize,

    /// N-gram length of the spelling model
    #[arg(long = "unkn", default_value_t = 3)]
    unkn: usize,

    /// Prune paths worse than the best by this much (0 disables)
    #[arg(long = "prune", default_value_t = 0.0)]
    prune: f64,

    /// The type of input
    #[arg(long = "input", value_enum, default_value = "text")]
    input: InputArg,

    /// A list of input files, one per line
    #[arg(long = "filelist")]
    filelist: Option<PathBuf>,

    /// The symbol file for the WFSTs, required for fst input
    #[arg(long = "symbolfile")]
    symbolfile: Option<PathBuf>,

    /// The prefix under which to print all output
    #[arg(long = "prefix")]
    prefix: String,

    /// The string used to separate characters inside a word
    #[arg(long = "separator", default_value = "")]
    separator: String,

    /// For WFST input, cache the lattices in memory
    #[arg(long = "cacheinput")]
    cacheinput: bool,

    /// Seed for the sampler
    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,

    /// Input files, unless --filelist names them
    files: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputArg {
    Text,
    Fst,
}

fn run(args: Args) -> Result<()> {
    let mut files = args.files.clone();
    if let Some(list) = &args.filelist {
        let text = std::fs::read_to_string(list)
            .with_context(|| format!("couldn't find the file list {}", list.display()))?;
        files.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from),
        );
    }
    let config = TrainConfig {
        burn_in: args.burnin,
        anneal_steps: args.annealsteps,
        anneal_step_length: args.anneallength,
        num_samples: args.samps,
        sample_rate: args.samprate,
        known_n: args.knownn,
        unk_n: args.unkn,
        prune_threshold: args.prune,
        input: match args.input {
            InputArg::Text => InputKind::Text,
            InputArg::Fst => InputKind::Fst,
        },
        input_files: files,
        symbol_file: args.symbolfile,
        prefix: args.prefix,
        separator: args.separator,
        cache_input: args.cacheinput,
        seed: args.seed,
        ..TrainConfig::default()
    };
    Trainer::new(config)?.train()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}
