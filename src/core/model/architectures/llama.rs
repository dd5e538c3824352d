use crate::core::model::{Backend, ContextParams, ModelParams, NativeContext, NativeModel, TokenId};
use crate::core::tokenizer::{create_tokenizer, TokenType, Tokenizer, TokenizerKind, Vocabulary};
use crate::core::{Error, Result};
use anyhow::Context as _;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;
use std::sync::Arc;

/// Quantized llama GGUF models executed with candle.
#[derive(Debug, Default)]
pub struct LlamaBackend {
    initialized: bool,
}

impl LlamaBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for LlamaBackend {
    fn name(&self) -> &str {
        "candle-llama"
    }

    fn init(&mut self) -> Result<()> {
        if !self.initialized {
            tracing::info!(
                "Initializing candle backend (cuda={}, metal={}, cpu threads={})",
                candle_core::utils::cuda_is_available(),
                candle_core::utils::metal_is_available(),
                candle_core::utils::get_num_threads()
            );
            self.initialized = true;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.initialized = false;
    }

    fn load_model(&mut self, path: &Path, params: &ModelParams) -> Result<Box<dyn NativeModel>> {
        let model = LlamaModel::load(path, params)
            .map_err(|e| Error::load_failed(path.display().to_string(), format!("{:#}", e)))?;
        Ok(Box::new(model))
    }
}

pub struct LlamaModel {
    weights: ModelWeights,
    device: Device,
    tokenizer: Arc<dyn Tokenizer>,
    trained_context_length: Option<usize>,
}

impl LlamaModel {
    pub fn load(path: &Path, params: &ModelParams) -> anyhow::Result<Self> {
        let device = select_device(params.gpu_layers)?;
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

        let loaded = if params.use_memory_map {
            // SAFETY: read-only mapping; the file is not modified while the
            // weights are copied out of it.
            let mmap = unsafe { memmap2::Mmap::map(&file) }
                .with_context(|| format!("mapping {}", path.display()))?;
            read_gguf(&mut Cursor::new(&mmap[..]), &device)?
        } else {
            read_gguf(&mut BufReader::new(file), &device)?
        };

        tracing::debug!(
            "Read {} ({:?} tokenizer, {} tokens, trained context {:?}) onto {:?}",
            path.display(),
            loaded.kind,
            loaded.vocab.size(),
            loaded.trained_context_length,
            device
        );

        Ok(Self {
            weights: loaded.weights,
            device,
            tokenizer: Arc::from(create_tokenizer(loaded.kind, loaded.vocab)),
            trained_context_length: loaded.trained_context_length,
        })
    }
}

impl NativeModel for LlamaModel {
    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn NativeContext>> {
        if let Some(trained) = self.trained_context_length {
            if params.context_length > trained {
                tracing::warn!(
                    "Context length {} exceeds the {} tokens the model was trained on",
                    params.context_length,
                    trained
                );
            }
        }

        Ok(Box::new(LlamaContext {
            weights: self.weights.clone(),
            device: self.device.clone(),
            tokenizer: Arc::clone(&self.tokenizer),
            params: *params,
            logits: None,
        }))
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.tokenizer.is_end_of_generation(token)
    }

    fn tokenize(&self, text: &str, capacity: usize) -> Result<Vec<TokenId>> {
        self.tokenizer.encode_bounded(text, capacity)
    }
}

/// Decode state: a private copy of the weights' KV cache plus the logits of
/// the last decoded position. Tensor storage is shared with the model.
pub struct LlamaContext {
    weights: ModelWeights,
    device: Device,
    tokenizer: Arc<dyn Tokenizer>,
    params: ContextParams,
    logits: Option<Vec<f32>>,
}

impl LlamaContext {
    fn forward(&mut self, ids: &[u32], position: usize) -> candle_core::Result<Vec<f32>> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let logits = self.weights.forward(&input, position)?;
        logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()
    }
}

impl NativeContext for LlamaContext {
    fn decode(&mut self, tokens: &[TokenId], position: usize) -> Result<()> {
        self.logits = None;
        if tokens.is_empty() {
            return Err(Error::decode_failed(position, "empty batch"));
        }
        if position + tokens.len() > self.params.context_length {
            return Err(Error::decode_failed(
                position,
                format!("context window of {} tokens exhausted", self.params.context_length),
            ));
        }

        let ids = tokens
            .iter()
            .map(|t| u32::try_from(t.0))
            .collect::<std::result::Result<Vec<u32>, _>>()
            .map_err(|_| Error::decode_failed(position, "negative token id"))?;

        // A prompt goes through as one forward pass: the quantized llama causal
        // mask is only valid for multi-token batches that start at position 0.
        let logits = self
            .forward(&ids, position)
            .map_err(|e| Error::decode_failed(position, e))?;
        self.logits = Some(logits);
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        self.tokenizer.piece(token)
    }

    fn context_length(&self) -> usize {
        self.params.context_length
    }

    fn clear(&mut self) {
        self.logits = None;
    }
}

struct LoadedGguf {
    weights: ModelWeights,
    vocab: Vocabulary,
    kind: TokenizerKind,
    trained_context_length: Option<usize>,
}

fn read_gguf<R: Read + Seek>(reader: &mut R, device: &Device) -> anyhow::Result<LoadedGguf> {
    let content = gguf_file::Content::read(reader).context("reading GGUF header")?;
    let (vocab, kind) = read_vocabulary(&content.metadata)?;
    let trained_context_length = content
        .metadata
        .get("llama.context_length")
        .and_then(|v| v.to_u32().ok())
        .map(|n| n as usize);

    let weights = ModelWeights::from_gguf(content, reader, device).context("reading llama weights")?;
    Ok(LoadedGguf {
        weights,
        vocab,
        kind,
        trained_context_length,
    })
}

fn read_vocabulary(
    metadata: &HashMap<String, gguf_file::Value>,
) -> anyhow::Result<(Vocabulary, TokenizerKind)> {
    let tokens = metadata
        .get("tokenizer.ggml.tokens")
        .context("GGUF has no tokenizer.ggml.tokens")?
        .to_vec()?
        .iter()
        .map(|v| v.to_string().cloned())
        .collect::<candle_core::Result<Vec<String>>>()?;

    let mut vocab = Vocabulary::new(tokens);
    if let Some(scores) = metadata.get("tokenizer.ggml.scores") {
        vocab.scores = scores
            .to_vec()?
            .iter()
            .map(|v| v.to_f32())
            .collect::<candle_core::Result<_>>()?;
    }
    if let Some(types) = metadata.get("tokenizer.ggml.token_type") {
        vocab.types = types
            .to_vec()?
            .iter()
            .map(|v| v.to_i32().map(TokenType::from_gguf))
            .collect::<candle_core::Result<_>>()?;
    }
    if let Some(merges) = metadata.get("tokenizer.ggml.merges") {
        vocab.merges = merges
            .to_vec()?
            .iter()
            .map(|v| v.to_string().cloned())
            .collect::<candle_core::Result<_>>()?;
    }

    let token_id = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.to_u32().ok())
            .map(|id| TokenId(id as i32))
    };
    vocab.bos_token = token_id("tokenizer.ggml.bos_token_id");
    vocab.eos_token = token_id("tokenizer.ggml.eos_token_id");
    vocab.eot_token = token_id("tokenizer.ggml.eot_token_id");
    vocab.unk_token = token_id("tokenizer.ggml.unknown_token_id");

    let kind = metadata
        .get("tokenizer.ggml.model")
        .and_then(|v| v.to_string().ok())
        .and_then(|m| TokenizerKind::from_gguf(m))
        .unwrap_or(TokenizerKind::SentencePiece);
    vocab.add_bos = metadata
        .get("tokenizer.ggml.add_bos_token")
        .and_then(|v| v.to_bool().ok())
        .unwrap_or(kind == TokenizerKind::SentencePiece);

    Ok((vocab, kind))
}

/// Any GPU layer request puts the whole model on the first available GPU.
fn select_device(gpu_layers: i32) -> anyhow::Result<Device> {
    if gpu_layers == 0 {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        tracing::warn!(
            "{} GPU layers requested but no GPU is available, running on CPU",
            gpu_layers
        );
        Ok(Device::Cpu)
    }
}
