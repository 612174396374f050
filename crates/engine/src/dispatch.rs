//! Request dispatcher: validates requests, chooses the assembler path,
//! acquires a slot and surfaces the decoder's response stream.

use kronk_api::{
    CancelToken, ChatMessage, ChatRequest, ChatResponse, EmbedRequest, Error, Result,
    SamplingParams, ToolDef, Usage, VisionRequest, OBJECT_CHAT, OBJECT_VISION,
};
use kronk_core::{Config, Layout, ResolvedModel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, RwLock};

use crate::backend::Backend;
use crate::decoder::{self, StreamParams};
use crate::metrics::metrics;
use crate::model::{
    Model, ModelConfig, ModelInfo, DEFAULT_LOAD_DEADLINE, DEFAULT_UNLOAD_DEADLINE,
};
use crate::prompt::{self, PromptAssembler, MEDIA_MARKER};
use crate::slots::{SlotPool, DEFAULT_IDLE_DEADLINE};

/// Buffered responses per stream before back-pressure kicks in.
const STREAM_BUFFER: usize = 32;

/// One loaded model with its slot pool and template assembler.
pub struct ModelEntry {
    model: Arc<Model>,
    pool: SlotPool,
    assembler: PromptAssembler,
}

impl ModelEntry {
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }
}

/// A model listed on disk, with its load state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelListing {
    pub id: String,
    pub loaded: bool,
    pub has_projection: bool,
}

/// The dispatcher owns the backend lifecycle and the table of loaded models.
pub struct Dispatcher {
    backend: Arc<Backend>,
    layout: Layout,
    config: Config,
    models: RwLock<HashMap<String, Arc<ModelEntry>>>,
}

impl Dispatcher {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_layout(config, Layout::new())
    }

    pub fn with_layout(config: Config, layout: Layout) -> Result<Self> {
        let backend = Backend::acquire()?;

        Ok(Self {
            backend,
            layout,
            config,
            models: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The model entry for an id, loading it on first use.
    pub async fn entry(&self, id: &str) -> Result<Arc<ModelEntry>> {
        let key = id.to_lowercase();

        if let Some(entry) = self.models.read().await.get(&key) {
            return Ok(entry.clone());
        }

        let resolved = self.layout.resolve_model(id)?;

        let mut models = self.models.write().await;
        if let Some(entry) = models.get(&key) {
            return Ok(entry.clone());
        }

        let entry = self.load_entry(resolved).await?;
        models.insert(key, entry.clone());

        Ok(entry)
    }

    async fn load_entry(&self, resolved: ResolvedModel) -> Result<Arc<ModelEntry>> {
        let cfg = ModelConfig {
            id: resolved.id,
            model_file: resolved.model_file,
            projection_file: resolved.projection_file,
            jinja_file: None,
            context: self.config.context.clone(),
            concurrency: self.config.server.concurrency,
            n_gpu_layers: None,
            use_mlock: false,
        };

        let backend = self.backend.clone();
        let load = tokio::task::spawn_blocking(move || Model::load(backend, cfg));
        let model = tokio::time::timeout(DEFAULT_LOAD_DEADLINE, load)
            .await
            .map_err(|_| Error::internal("model load deadline exceeded"))?
            .map_err(|e| Error::internal(format!("model load task failed: {e}")))??;
        let model = Arc::new(model);

        let pool = SlotPool::new(model.clone(), DEFAULT_IDLE_DEADLINE)?;
        let assembler = PromptAssembler::new(model.template());

        Ok(Arc::new(ModelEntry {
            model,
            pool,
            assembler,
        }))
    }

    /// Wait for a model's streams to drain, then release it. On timeout the
    /// model stays loaded and *busy* is returned with the stream count.
    pub async fn unload(&self, id: &str, deadline: Option<Duration>) -> Result<()> {
        let key = id.to_lowercase();

        let entry = self
            .models
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model not loaded: {id}")))?;

        entry
            .model
            .unload(deadline.unwrap_or(DEFAULT_UNLOAD_DEADLINE))
            .await?;

        self.models.write().await.remove(&key);
        Ok(())
    }

    /// Models on disk plus their load state.
    pub async fn list(&self) -> Result<Vec<ModelListing>> {
        let loaded = self.models.read().await;

        Ok(self
            .layout
            .list_models()?
            .into_iter()
            .map(|m| ModelListing {
                loaded: loaded.contains_key(&m.id.to_lowercase()),
                has_projection: m.projection_file.is_some(),
                id: m.id,
            })
            .collect())
    }

    /// The card information of a loaded (or loadable) model.
    pub async fn model_info(&self, id: &str) -> Result<ModelInfo> {
        Ok(self.entry(id).await?.model.info().clone())
    }

    pub fn metrics_snapshot(&self) -> serde_json::Value {
        metrics().snapshot()
    }

    // -------------------------------------------------------------------------
    // Chat

    /// Run a chat request to completion and return the terminal response.
    pub async fn chat(
        &self,
        cancel: &CancelToken,
        id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        let mut rx = self.chat_stream(cancel, id, request).await?;

        let mut last = None;
        while let Some(response) = rx.recv().await {
            last = Some(response);
        }

        last.ok_or_else(|| Error::internal("stream ended without a response"))
    }

    /// Start a streaming chat request. The receiver yields deltas in index
    /// order and ends with exactly one terminal response.
    pub async fn chat_stream(
        &self,
        cancel: &CancelToken,
        id: &str,
        request: ChatRequest,
    ) -> Result<Receiver<ChatResponse>> {
        if request.messages.is_empty() {
            return Err(Error::invalid("missing messages"));
        }

        let entry = self.entry(id).await?;
        metrics().add_request();

        let started = Instant::now();
        let prompt = entry.model.apply_chat_template(&request.messages, true)?;
        metrics().add_prompt_creation_time(started.elapsed());

        self.spawn_stream(
            cancel,
            &entry,
            OBJECT_CHAT,
            prompt,
            Vec::new(),
            request.params,
            request.tools,
        )
        .await
    }

    /// Start a streaming vision request for an on-disk image.
    pub async fn vision_stream(
        &self,
        cancel: &CancelToken,
        id: &str,
        request: VisionRequest,
    ) -> Result<Receiver<ChatResponse>> {
        let media = std::fs::read(&request.image_path).map_err(|e| {
            Error::invalid(format!(
                "unable to read image {}: {e}",
                request.image_path.display()
            ))
        })?;

        let entry = self.entry(id).await?;
        metrics().add_request();

        let messages = [
            request.message,
            ChatMessage::new("user", MEDIA_MARKER),
        ];

        let started = Instant::now();
        let prompt = entry.model.apply_chat_template(&messages, true)?;
        metrics().add_prompt_creation_time(started.elapsed());

        self.spawn_stream(
            cancel,
            &entry,
            OBJECT_VISION,
            prompt,
            vec![media],
            request.params,
            Vec::new(),
        )
        .await
    }

    /// Start a stream from an OpenAI-shaped request document. Media content
    /// routes through the multimodal path; everything else renders through
    /// the model's Jinja template.
    pub async fn completions_stream(
        &self,
        cancel: &CancelToken,
        body: &serde_json::Value,
    ) -> Result<Receiver<ChatResponse>> {
        let id = match body.get("model") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id.clone(),
            Some(serde_json::Value::String(_)) | None => {
                return Err(Error::invalid("model is required"));
            }
            Some(_) => return Err(Error::invalid("model must be a string")),
        };

        let entry = self.entry(&id).await?;
        metrics().add_request();

        let params: SamplingParams =
            serde_json::from_value(body.clone()).map_err(|e| Error::invalid(e.to_string()))?;

        let tools: Vec<ToolDef> = match body.get("tools") {
            Some(tools) => serde_json::from_value(tools.clone())
                .map_err(|e| Error::invalid(format!("tools: {e}")))?,
            None => Vec::new(),
        };

        let started = Instant::now();
        let (object, prompt, media) = if prompt::is_media_request(body) {
            let assembled = entry.assembler.assemble(body)?;
            (OBJECT_VISION, assembled.prompt, assembled.media)
        } else {
            (OBJECT_CHAT, entry.assembler.render(body)?, Vec::new())
        };
        metrics().add_prompt_creation_time(started.elapsed());

        self.spawn_stream(cancel, &entry, object, prompt, media, params, tools)
            .await
    }

    async fn spawn_stream(
        &self,
        cancel: &CancelToken,
        entry: &ModelEntry,
        object: &'static str,
        prompt: String,
        media: Vec<Vec<u8>>,
        params: SamplingParams,
        tools: Vec<ToolDef>,
    ) -> Result<Receiver<ChatResponse>> {
        let slot = entry.pool.acquire(cancel).await?;

        let (tx, rx) = channel(STREAM_BUFFER);
        let cancel = cancel.clone();

        let stream = StreamParams {
            id: uuid::Uuid::new_v4().to_string(),
            object,
            prompt,
            media,
            params,
            tools,
        };

        slot.run(Box::new(move |model, warm| {
            run_slot_job(&cancel, model, warm, stream, &tx);
        }))?;

        Ok(rx)
    }

    // -------------------------------------------------------------------------
    // Embeddings

    /// Compute a unit-length embedding vector for the text.
    pub async fn embed(
        &self,
        cancel: &CancelToken,
        id: &str,
        request: EmbedRequest,
    ) -> Result<Vec<f32>> {
        if request.text.is_empty() {
            return Err(Error::invalid("missing text"));
        }

        let entry = self.entry(id).await?;
        metrics().add_request();

        let slot = entry.pool.acquire(cancel).await?;

        let (tx, rx) = oneshot::channel();
        let cancel = cancel.clone();
        let text = request.text;

        slot.run(Box::new(move |model, _warm| {
            let result = model.embed(&cancel, &text);
            if result.is_err() {
                metrics().add_error();
            }
            let _ = tx.send(result);
        }))?;

        rx.await
            .map_err(|_| Error::internal("embedding job dropped"))?
    }
}

fn run_slot_job(
    cancel: &CancelToken,
    model: &Model,
    warm: &mut crate::slots::WarmContext<'_>,
    stream: StreamParams,
    tx: &Sender<ChatResponse>,
) {
    let ctx = match warm.fresh() {
        Ok(ctx) => ctx,
        Err(err) => {
            metrics().add_error();
            let _ = tx.try_send(ChatResponse::error(
                &stream.id,
                stream.object,
                &model.info().id,
                0,
                &err,
                Usage::default(),
            ));
            return;
        }
    };

    let clean = decoder::run_stream(cancel, model, ctx, stream, tx);
    if !clean {
        warm.retire();
    }
}
