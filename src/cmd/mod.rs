use anyhow::{Context, Result};
use clap::Args;
use llambo::{Handle, ModelParams, Runtime, RUNTIME};
use serde::Deserialize;
use serde_json::json;
use std::io::{self, BufRead, Write};

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// GGUF file, absolute or relative to LLAMBO_MODELS
    #[arg(short, long)]
    pub model: String,

    /// Read the file with buffered I/O instead of memory-mapping it
    #[arg(long)]
    pub no_mmap: bool,

    #[arg(long, default_value_t = 0)]
    pub gpu_layers: i32,
}

impl ModelArgs {
    fn params(&self) -> ModelParams {
        ModelParams {
            use_memory_map: !self.no_mmap,
            gpu_layers: self.gpu_layers,
        }
    }
}

fn load(runtime: &Runtime, model: &ModelArgs) -> Result<Handle> {
    runtime
        .try_load(&model.model, model.params())
        .with_context(|| format!("loading {}", model.model))
}

pub fn generate(model: &ModelArgs, prompt: &str, max_tokens: i64, temperature: f64) -> Result<()> {
    let runtime = &*RUNTIME;
    let handle = load(runtime, model)?;

    let mut stdout = io::stdout().lock();
    let mut write_error = None;
    let generation = runtime.try_stream(
        handle.raw(),
        prompt,
        usize::try_from(max_tokens).unwrap_or(0),
        temperature as f32,
        runtime.generate_options(),
        |step| {
            if write_error.is_none() {
                if let Err(e) = stdout.write_all(&step.bytes).and_then(|_| stdout.flush()) {
                    write_error = Some(e);
                }
            }
        },
    );
    runtime.shutdown();

    let generation = generation.context("generation failed")?;
    if let Some(e) = write_error {
        return Err(e).context("writing to stdout");
    }
    writeln!(stdout)?;

    tracing::info!(
        "{} prompt tokens, {} generated, stopped on {:?}",
        generation.prompt_tokens,
        generation.tokens_generated,
        generation.stop_reason
    );
    Ok(())
}

pub fn tokenize(model: &ModelArgs, text: &str) -> Result<()> {
    let runtime = &*RUNTIME;
    let handle = load(runtime, model)?;
    let tokens = runtime.try_tokenize(handle.raw(), text);
    runtime.shutdown();

    println!("{}", serde_json::to_string(&tokens?)?);
    Ok(())
}

pub fn info(model: &ModelArgs) -> Result<()> {
    let runtime = &*RUNTIME;
    let handle = load(runtime, model)?;
    let info = runtime.try_describe(handle.raw());
    runtime.shutdown();

    println!("{}", serde_json::to_string_pretty(&info?)?);
    Ok(())
}

pub fn serve() -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let result = serve_lines(&RUNTIME, stdin.lock(), stdout.lock());
    RUNTIME.shutdown();
    result
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Load {
        path: String,
        #[serde(default = "default_use_mmap")]
        use_mmap: bool,
        #[serde(default)]
        gpu_layers: i32,
    },
    Free {
        handle: i64,
    },
    Tokenize {
        handle: i64,
        text: String,
    },
    Generate {
        handle: i64,
        prompt: String,
        #[serde(default = "default_max_tokens")]
        max_tokens: i64,
        #[serde(default)]
        temperature: f64,
    },
    Describe {
        handle: i64,
    },
}

fn default_use_mmap() -> bool {
    true
}

fn default_max_tokens() -> i64 {
    128
}

/// One request per input line, one JSON response per output line. Responses
/// carry the host sentinels unchanged.
pub fn serve_lines<R: BufRead, W: Write>(runtime: &Runtime, input: R, mut output: W) -> Result<()> {
    for line in input.lines() {
        let line = line.context("reading request")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(runtime, request),
            Err(e) => json!({ "error": e.to_string() }),
        };
        writeln!(output, "{}", serde_json::to_string(&response)?)?;
        output.flush()?;
    }
    Ok(())
}

fn handle_request(runtime: &Runtime, request: Request) -> serde_json::Value {
    match request {
        Request::Load {
            path,
            use_mmap,
            gpu_layers,
        } => json!({ "handle": runtime.load(&path, use_mmap, gpu_layers) }),
        Request::Free { handle } => json!({ "status": runtime.free(handle) }),
        Request::Tokenize { handle, text } => json!({ "tokens": runtime.tokenize(handle, &text) }),
        Request::Generate {
            handle,
            prompt,
            max_tokens,
            temperature,
        } => json!({ "text": runtime.generate(handle, &prompt, max_tokens, temperature) }),
        Request::Describe { handle } => {
            let info = runtime.describe(handle);
            json!({ "info": serde_json::from_str::<serde_json::Value>(&info).unwrap_or(serde_json::Value::Null) })
        }
    }
}
