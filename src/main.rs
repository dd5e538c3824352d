mod cmd;

use clap::{Parser, Subcommand};
use cmd::ModelArgs;
use std::process;

#[derive(Parser)]
#[command(name = "llambo")]
#[command(version)]
#[command(about = "Greedy text generation on local GGUF models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a continuation of PROMPT, streaming it to stdout
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long, default_value_t = 128)]
        max_tokens: i64,
        #[arg(long, default_value_t = 0.0)]
        temperature: f64,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Print the token ids of TEXT
    Tokenize {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Print what the registry records for a loaded model
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Answer JSON requests read line by line from stdin
    Serve,
}

fn main() {
    let cli = Cli::parse();
    llambo::envconfig::init_tracing(&llambo::envconfig::log_filter());

    let result = match cli.command {
        Commands::Generate {
            model,
            max_tokens,
            temperature,
            prompt,
        } => cmd::generate(&model, &prompt.join(" "), max_tokens, temperature),
        Commands::Tokenize { model, text } => cmd::tokenize(&model, &text.join(" ")),
        Commands::Info { model } => cmd::info(&model),
        Commands::Serve => cmd::serve(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
