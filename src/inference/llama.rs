//! llama.cpp backend
//!
//! [`LlamaLoader`] loads GGUF files through `llama-cpp-2`. Each completion creates a fresh
//! context, decodes the prompt, then samples token by token until end-of-generation, a stop
//! sequence, or `max_tokens`.

use crate::inference::engine::{
    truncate_at_stop, Completion, CompletionRequest, EngineError, EngineLoader, InferenceEngine,
};
use crate::types::{AppConfig, ModelDescriptor};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};

pub struct LlamaLoader {
    backend: Arc<LlamaBackend>,
    gpu_layers: u32,
    context_size: u32,
}

impl LlamaLoader {
    /// Initialize the llama.cpp backend; only one may exist per process
    pub fn new(config: &AppConfig) -> Result<Self, EngineError> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::Unavailable(format!("llama.cpp backend: {:?}", e)))?;
        Ok(Self {
            backend: Arc::new(backend),
            gpu_layers: config.gpu_layers,
            context_size: config.context_size,
        })
    }
}

impl EngineLoader for LlamaLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceEngine>, EngineError> {
        let params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, &descriptor.path, &params)
            .map_err(|e| EngineError::Load(format!("{}: {:?}", descriptor.path.display(), e)))?;

        tracing::info!(
            "llama.cpp loaded {} ({:.1} MB, {} GPU layers)",
            descriptor.id,
            descriptor.file_size_mb(),
            self.gpu_layers
        );

        Ok(Box::new(LlamaEngine {
            backend: self.backend.clone(),
            model: Mutex::new(model),
            context_size: self.context_size.min(descriptor.context_length.max(512)),
        }))
    }
}

pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    model: Mutex<LlamaModel>,
    context_size: u32,
}

// SAFETY: the model is only touched through the mutex, from blocking worker threads.
unsafe impl Send for LlamaEngine {}
unsafe impl Sync for LlamaEngine {}

impl LlamaEngine {
    fn sampler(request: &CompletionRequest) -> LlamaSampler {
        if request.temperature <= 0.0 {
            return LlamaSampler::greedy();
        }
        LlamaSampler::chain_simple([
            LlamaSampler::top_p(request.top_p, 1),
            LlamaSampler::temp(request.temperature),
            LlamaSampler::dist(rand_seed()),
        ])
    }
}

fn rand_seed() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

impl InferenceEngine for LlamaEngine {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let gen_err = |what: &str, e: &dyn std::fmt::Debug| {
            EngineError::Generation(format!("{}: {:?}", what, e))
        };

        let ctx_params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(self.context_size));
        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| gen_err("context", &e))?;

        let tokens = model
            .str_to_token(&request.prompt, AddBos::Always)
            .map_err(|e| gen_err("tokenize", &e))?;
        if tokens.len() >= self.context_size as usize {
            return Err(EngineError::Generation(format!(
                "prompt of {} tokens does not fit a {} token context",
                tokens.len(),
                self.context_size
            )));
        }

        let mut batch = LlamaBatch::new(self.context_size as usize, 1);
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| gen_err("batch", &e))?;
        }
        ctx.decode(&mut batch).map_err(|e| gen_err("decode", &e))?;

        let mut sampler = Self::sampler(request);
        let mut text = String::new();
        let mut completion_tokens = 0u32;
        let mut position = tokens.len() as i32;
        let room = (self.context_size as usize - tokens.len()).min(request.max_tokens as usize);

        for _ in 0..room {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            if model.is_eog_token(token) {
                break;
            }

            let piece = model
                .token_to_str(token, Special::Tokenize)
                .map_err(|e| gen_err("detokenize", &e))?;
            text.push_str(&piece);
            completion_tokens += 1;

            if truncate_at_stop(&text, &request.stop).1 {
                break;
            }

            batch.clear();
            batch
                .add(token, position, &[0], true)
                .map_err(|e| gen_err("batch", &e))?;
            position += 1;
            ctx.decode(&mut batch).map_err(|e| gen_err("decode", &e))?;
        }

        let (text, _) = truncate_at_stop(&text, &request.stop);
        Ok(Completion {
            text,
            prompt_tokens: tokens.len() as u32,
            completion_tokens,
        })
    }
}
