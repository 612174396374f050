//! Model handle: owns one loaded model and produces execution contexts.

use kronk_api::{CancelToken, ChatMessage, Error, Result};
use kronk_core::ContextConfig;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::mtmd::{MtmdContext, MtmdContextParams};
use llama_cpp_2::token::LlamaToken;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::metrics::metrics;

/// How often the unload path polls the active-streams counter.
const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default deadline for `unload` when the caller supplies none.
pub const DEFAULT_UNLOAD_DEADLINE: Duration = Duration::from_secs(5);

/// Default deadline for model loading.
pub const DEFAULT_LOAD_DEADLINE: Duration = Duration::from_secs(120);

/// Load-time configuration for a model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model identifier (file stem of the .gguf file).
    pub id: String,
    pub model_file: PathBuf,
    pub projection_file: Option<PathBuf>,
    /// Caller-provided Jinja template file, overriding the model's own.
    pub jinja_file: Option<PathBuf>,
    pub context: ContextConfig,
    /// Number of execution slots.
    pub concurrency: usize,
    /// Layers to offload to the GPU. None = engine default.
    pub n_gpu_layers: Option<u32>,
    pub use_mlock: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            model_file: PathBuf::new(),
            projection_file: None,
            jinja_file: None,
            context: ContextConfig::default(),
            concurrency: 1,
            n_gpu_layers: None,
            use_mlock: false,
        }
    }
}

/// The model's card information.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub desc: String,
    pub size: u64,
    pub has_encoder: bool,
    pub has_decoder: bool,
    pub is_recurrent: bool,
    pub is_hybrid: bool,
    pub is_embedding: bool,
    pub n_embd: i32,
    pub context_window: u32,
    pub metadata: BTreeMap<String, String>,
}

/// An immutable handle to one loaded model. Weights are read-shared across
/// streams; execution contexts are produced per request and never shared.
pub struct Model {
    cfg: ModelConfig,
    backend: Arc<Backend>,
    model: LlamaModel,
    template: String,
    info: ModelInfo,
    active_streams: AtomicI32,
    media_prefill: Mutex<()>,
}

impl Model {
    /// Load a model from disk. Blocks for the duration of the load; callers
    /// on the async side wrap this in `spawn_blocking`.
    pub fn load(backend: Arc<Backend>, cfg: ModelConfig) -> Result<Self> {
        validate_config(&cfg)?;

        let mut params = LlamaModelParams::default();
        if let Some(n) = cfg.n_gpu_layers {
            params = params.with_n_gpu_layers(n);
        }
        if cfg.use_mlock {
            params = params.with_use_mlock(true);
        }

        let started = Instant::now();
        let model = LlamaModel::load_from_file(backend.raw(), &cfg.model_file, &params)
            .map_err(|e| Error::internal(format!("unable to load model: {e}")))?;
        metrics().add_model_file_load_time(started.elapsed());

        let template = resolve_template(&cfg, &model)?;

        // A zero context window means the model's training window.
        let mut cfg = cfg;
        if cfg.context.context_window == 0 {
            cfg.context.context_window = model.n_ctx_train();
        }

        let info = model_info(&cfg, &model);

        tracing::info!(
            id = %cfg.id,
            size = info.size,
            context_window = info.context_window,
            "model loaded"
        );

        Ok(Self {
            cfg,
            backend,
            model,
            template,
            info,
            active_streams: AtomicI32::new(0),
            media_prefill: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// The resolved chat template source, for the Jinja assembler.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Tokenize text. Pure with respect to the model; safe to call in
    /// parallel with other streams.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<LlamaToken>> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        self.model
            .str_to_token(text, add_bos)
            .map_err(|e| Error::internal(format!("tokenize: {e}")))
    }

    /// The raw bytes of one token's piece. Partial UTF-8 sequences are the
    /// caller's concern.
    pub fn token_bytes(&self, token: LlamaToken) -> Result<Vec<u8>> {
        self.model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| Error::internal(format!("detokenize: {e}")))
    }

    /// Whether the token ends generation.
    pub fn is_eog(&self, token: LlamaToken) -> bool {
        self.model.is_eog_token(token)
    }

    /// Render messages through the model's chat template.
    pub fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        let template = match self.model.chat_template(None) {
            Ok(t) => t,
            Err(_) => LlamaChatTemplate::new(&self.template)
                .or_else(|_| LlamaChatTemplate::new("chatml"))
                .map_err(|e| Error::internal(format!("chat template: {e}")))?,
        };

        let msgs = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::invalid(format!("chat message: {e}")))?;

        self.model
            .apply_chat_template(&template, &msgs, add_generation_prompt)
            .map_err(|e| Error::internal(format!("apply chat template: {e}")))
    }

    /// Create an execution context for a single request. The context is not
    /// safe to share between streams.
    pub fn new_context(&self) -> Result<LlamaContext<'_>> {
        self.model
            .new_context(self.backend.raw(), self.context_params(false))
            .map_err(|e| Error::internal(format!("unable to init context from model: {e}")))
    }

    fn embedding_context(&self) -> Result<LlamaContext<'_>> {
        self.model
            .new_context(self.backend.raw(), self.context_params(true))
            .map_err(|e| Error::internal(format!("unable to init embedding context: {e}")))
    }

    fn context_params(&self, embeddings: bool) -> LlamaContextParams {
        let ctx = &self.cfg.context;

        let mut params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(ctx.context_window))
            .with_n_batch(ctx.batch_size);

        if ctx.threads > 0 {
            params = params.with_n_threads(ctx.threads);
        }
        if ctx.threads_batch > 0 {
            params = params.with_n_threads_batch(ctx.threads_batch);
        }
        if ctx.flash_attention {
            params = params.with_flash_attention(true);
        }
        if embeddings {
            params = params.with_embeddings(true);
        }

        params
    }

    /// Create the multimodal context from the projection file.
    pub fn media_context(&self) -> Result<MtmdContext> {
        let proj = self
            .cfg
            .projection_file
            .as_ref()
            .ok_or_else(|| Error::invalid("projection file not set"))?;

        let started = Instant::now();
        let params = MtmdContextParams::default();

        let mctx = MtmdContext::init_from_file(proj, &self.model, &params)
            .map_err(|e| Error::internal(format!("unable to init media context: {e}")))?;
        metrics().add_proj_file_load_time(started.elapsed());

        Ok(mctx)
    }

    /// The multimodal prefill helper is not thread-safe; hold this for the
    /// duration of the media pass only.
    pub fn media_prefill_lock(&self) -> MutexGuard<'_, ()> {
        self.media_prefill
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compute a unit-length embedding vector for the text.
    pub fn embed(&self, cancel: &CancelToken, text: &str) -> Result<Vec<f32>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(
                cancel.cause().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }

        let mut ctx = self.embedding_context()?;

        let tokens = self.tokenize(text, true)?;
        if tokens.is_empty() {
            return Err(Error::invalid("text tokenized to an empty sequence"));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| Error::internal(format!("batch add: {e}")))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| Error::internal(format!("decode: {e}")))?;

        let vec = ctx
            .embeddings_seq_ith(0)
            .map_err(|e| Error::internal(format!("unable to get embeddings: {e}")))?
            .to_vec();

        Ok(normalize(vec))
    }

    pub(crate) fn stream_started(&self) {
        self.active_streams.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn stream_finished(&self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_streams(&self) -> i32 {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Wait for in-flight streams to drain. On timeout returns *busy*
    /// carrying the current counter value.
    pub async fn unload(&self, deadline: Duration) -> Result<()> {
        let give_up = Instant::now() + deadline;

        while self.active_streams() > 0 {
            if Instant::now() >= give_up {
                return Err(Error::Busy {
                    active: self.active_streams(),
                });
            }
            tokio::time::sleep(UNLOAD_POLL_INTERVAL).await;
        }

        Ok(())
    }
}

fn validate_config(cfg: &ModelConfig) -> Result<()> {
    if cfg.id.is_empty() {
        return Err(Error::invalid("model id is required"));
    }
    if !cfg.model_file.exists() {
        return Err(Error::NotFound(format!(
            "model file not found: {}",
            cfg.model_file.display()
        )));
    }
    if cfg.concurrency == 0 {
        return Err(Error::invalid("concurrency must be at least 1"));
    }
    Ok(())
}

/// Template resolution: caller Jinja file, then the model's own template,
/// then the chatml literal. An empty result fails the load.
fn resolve_template(cfg: &ModelConfig, model: &LlamaModel) -> Result<String> {
    if let Some(path) = &cfg.jinja_file {
        let template = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid(format!("failed to read jinja template: {e}")))?;

        if template.is_empty() {
            return Err(Error::invalid("jinja template is empty"));
        }

        return Ok(template);
    }

    let template = model
        .meta_val_str("tokenizer.chat_template")
        .unwrap_or_default();

    if !template.is_empty() {
        return Ok(template);
    }

    Ok("chatml".to_string())
}

fn model_info(cfg: &ModelConfig, model: &LlamaModel) -> ModelInfo {
    let mut metadata = BTreeMap::new();
    for i in 0..model.meta_count() {
        let Ok(key) = model.meta_key_by_index(i) else {
            continue;
        };
        let Ok(value) = model.meta_val_str_by_index(i) else {
            continue;
        };
        metadata.insert(key, value);
    }

    let desc = metadata
        .get("general.name")
        .cloned()
        .unwrap_or_else(|| cfg.id.clone());

    let has_decoder = model.has_decoder();
    let is_recurrent = model.is_recurrent();
    let arch = metadata
        .get("general.architecture")
        .map(String::as_str)
        .unwrap_or_default();

    ModelInfo {
        id: cfg.id.clone(),
        desc,
        size: model.size(),
        has_encoder: model.has_encoder(),
        has_decoder,
        is_recurrent,
        is_hybrid: detect_hybrid(&metadata),
        is_embedding: detect_embedding(arch, has_decoder),
        n_embd: model.n_embd(),
        context_window: cfg.context.context_window,
        metadata,
    }
}

/// Hybrid models carry both attention and state-space layer metadata.
fn detect_hybrid(metadata: &BTreeMap<String, String>) -> bool {
    let has_ssm = metadata.keys().any(|k| k.contains(".ssm."));
    let has_attention = metadata.keys().any(|k| k.contains(".attention."));
    has_ssm && has_attention
}

fn detect_embedding(arch: &str, has_decoder: bool) -> bool {
    !has_decoder || arch.contains("bert") || arch.contains("embedding")
}

fn normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let sum: f64 = vec.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    if sum == 0.0 {
        return vec;
    }

    let norm = (1.0 / sum.sqrt()) as f32;
    for v in &mut vec {
        *v *= norm;
    }

    vec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_yields_unit_length() {
        let vec = normalize(vec![3.0, 4.0]);
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(vec[0] > 0.0 && vec[1] > 0.0);
    }

    #[test]
    fn normalize_leaves_zero_vectors_alone() {
        let vec = normalize(vec![0.0, 0.0, 0.0]);
        assert_eq!(vec, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn hybrid_detection_needs_both_layer_kinds() {
        let mut metadata = BTreeMap::new();
        metadata.insert("jamba.ssm.conv_kernel".to_string(), "4".to_string());
        assert!(!detect_hybrid(&metadata));

        metadata.insert("jamba.attention.head_count".to_string(), "32".to_string());
        assert!(detect_hybrid(&metadata));
    }

    #[test]
    fn embedding_detection() {
        assert!(detect_embedding("bert", true));
        assert!(detect_embedding("llama", false));
        assert!(!detect_embedding("llama", true));
    }

    #[test]
    fn config_validation_rejects_missing_pieces() {
        let cfg = ModelConfig::default();
        assert!(matches!(
            validate_config(&cfg),
            Err(Error::InvalidArgument(_))
        ));

        let cfg = ModelConfig {
            id: "m".to_string(),
            model_file: PathBuf::from("/definitely/not/here.gguf"),
            ..Default::default()
        };
        assert!(matches!(validate_config(&cfg), Err(Error::NotFound(_))));
    }
}
