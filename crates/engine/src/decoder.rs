//! Decoder core: drives the native engine one token at a time, recognising
//! in-band control tokens and producing a monotonic stream of response
//! deltas plus one terminal response with the final usage tally.

use kronk_api::{
    CancelToken, ChatResponse, Error, Result, SamplingParams, ToolDef, Usage, OBJECT_VISION,
};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::mtmd::{MtmdBitmap, MtmdInputText};
use llama_cpp_2::sampling::LlamaSampler;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tokio::sync::mpsc::Sender;

use crate::metrics::metrics;
use crate::model::Model;
use crate::sampler::{self, StopMatcher};
use crate::tooling::{
    self, ChannelDisposition, Piece, PieceSource, TAG_CHANNEL, TAG_END, TAG_THINK_CLOSE,
    TAG_THINK_OPEN, TAG_TOOL_OPEN,
};

/// Everything one stream needs beyond the model and its context.
pub(crate) struct StreamParams {
    pub id: String,
    pub object: &'static str,
    pub prompt: String,
    pub media: Vec<Vec<u8>>,
    pub params: SamplingParams,
    pub tools: Vec<ToolDef>,
}

/// The per-stream constants the token loop works against.
struct StreamContext<'a> {
    id: &'a str,
    object: &'static str,
    model_name: &'a str,
    input_tokens: usize,
    max_tokens: usize,
    tools: &'a [ToolDef],
    stop: &'a [String],
}

/// Run one stream to completion on the current thread, sending responses
/// through `tx`. Returns false when the stream died on a panic, in which
/// case the execution context must be retired.
pub(crate) fn run_stream(
    cancel: &CancelToken,
    model: &Model,
    ctx: &mut LlamaContext<'_>,
    req: StreamParams,
    tx: &Sender<ChatResponse>,
) -> bool {
    // Native failures must not unwind across the stream boundary; they
    // become one terminal error response instead.
    let id = req.id.clone();
    let object = req.object;
    let model_name = model.info().id.clone();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        stream_tokens(cancel, model, ctx, req, tx);
    }));

    if outcome.is_err() {
        metrics().add_panic();
        let err = Error::internal("native engine failure");
        let _ = tx.try_send(ChatResponse::error(
            &id,
            object,
            &model_name,
            0,
            &err,
            Usage::default(),
        ));
        return false;
    }

    true
}

fn stream_tokens(
    cancel: &CancelToken,
    model: &Model,
    ctx: &mut LlamaContext<'_>,
    req: StreamParams,
    tx: &Sender<ChatResponse>,
) {
    let model_name = model.info().id.clone();

    // -------------------------------------------------------------------------
    // Prefill the prompt (and any media) into the context.

    let prefill = match prefill(model, ctx, &req) {
        Ok(p) => p,
        Err(err) => {
            metrics().add_error();
            let _ = tx.try_send(ChatResponse::error(
                &req.id,
                req.object,
                &model_name,
                0,
                &err,
                Usage::default(),
            ));
            return;
        }
    };

    let max_tokens = sampler::resolve_max_tokens(
        &req.params,
        model.info().context_window,
        prefill.input_tokens,
    );

    let stream = StreamContext {
        id: &req.id,
        object: req.object,
        model_name: &model_name,
        input_tokens: prefill.input_tokens,
        max_tokens,
        tools: &req.tools,
        stop: &req.params.stop,
    };

    let seq_count = model.config().context.seq_count.max(1) as i32;
    let mut src = EngineSource {
        cancel: cancel.clone(),
        model,
        ctx,
        sampler: sampler::build(&req.params),
        batch: LlamaBatch::new(model.config().context.batch_size as usize, seq_count),
        n_cur: prefill.n_past,
        utf8: encoding_rs::UTF_8.new_decoder(),
    };

    run_machine(cancel, &mut src, &stream, tx);
}

/// The inner token loop plus the outer tag state machine, working against
/// any source of complete pieces.
fn run_machine(
    cancel: &CancelToken,
    src: &mut dyn PieceSource,
    stream: &StreamContext<'_>,
    tx: &Sender<ChatResponse>,
) {
    let mut reason_tokens = 0usize;
    let mut completion_tokens = 0usize;
    let mut output_tokens = 0usize;
    let mut tokens_per_second = 0.0f64;

    let usage = |reason: usize, completion: usize, tps: f64| Usage {
        input_tokens: stream.input_tokens,
        reasoning_tokens: reason,
        completion_tokens: completion,
        output_tokens: reason + completion,
        tokens_per_second: tps,
    };

    let send_error = |index: usize, err: &Error, u: Usage| {
        metrics().add_error();
        let _ = tx.try_send(ChatResponse::error(
            stream.id,
            stream.object,
            stream.model_name,
            index,
            err,
            u,
        ));
    };

    if stream.max_tokens == 0 {
        let u = usage(0, 0, 0.0);
        metrics().add_chat_completions_usage(&u);
        let _ = tx.blocking_send(ChatResponse::complete(
            stream.id,
            stream.object,
            stream.model_name,
            1,
            String::new(),
            String::new(),
            Vec::new(),
            u,
        ));
        return;
    }

    let mut stop = StopMatcher::new(stream.stop);

    // These builders accumulate the final content for each region.
    let mut final_reasoning = String::new();
    let mut final_content = String::new();
    let mut tool_content = String::new();
    let mut tool_flag = false;

    // These flags track what region the model is operating in.
    let mut reason_flag: u32 = 0;
    let mut output_flag: u32 = 0;

    let mut index: usize = 0;
    let mut emitted_at_index = false;

    let started = Instant::now();
    let mut first_token_seen = false;

    loop {
        if cancel.is_cancelled() {
            let cause = cancel.cause().unwrap_or_else(|| "cancelled".to_string());
            let error_index = if emitted_at_index { index + 1 } else { index };
            send_error(
                error_index,
                &Error::Cancelled(cause),
                usage(reason_tokens, completion_tokens, tokens_per_second),
            );
            return;
        }

        if output_tokens >= stream.max_tokens {
            break;
        }

        index += 1;
        emitted_at_index = false;

        let piece = match src.next_piece() {
            Ok(piece) => piece,
            Err(err) => {
                send_error(
                    index,
                    &err,
                    usage(reason_tokens, completion_tokens, tokens_per_second),
                );
                return;
            }
        };

        let Some(piece) = piece else {
            break;
        };

        // ---------------------------------------------------------------------
        // Special tags parsed out of the response.

        match piece.text.as_str() {
            TAG_THINK_OPEN => {
                reason_flag = 1;
                reason_tokens += piece.tokens;
                output_tokens = reason_tokens + completion_tokens;
                continue;
            }

            TAG_THINK_CLOSE => {
                reason_flag = 0;
                completion_tokens += piece.tokens;
                output_tokens = reason_tokens + completion_tokens;
                continue;
            }

            TAG_TOOL_OPEN => {
                let budget = stream.max_tokens.saturating_sub(output_tokens);
                let capture = match tooling::collect_tool_call(src, budget) {
                    Ok(c) => c,
                    Err(err) => {
                        send_error(
                            index,
                            &err,
                            usage(reason_tokens, completion_tokens, tokens_per_second),
                        );
                        return;
                    }
                };

                // A tool call cut off by the token budget is discarded.
                if capture.over_budget {
                    break;
                }

                tool_flag = true;
                completion_tokens += src.count_tokens(&capture.text);
                output_tokens = reason_tokens + completion_tokens;
                tool_content.push_str(&capture.text);
                break;
            }

            TAG_CHANNEL => {
                let budget = stream.max_tokens.saturating_sub(output_tokens);
                let capture = match tooling::collect_channel(src, budget) {
                    Ok(c) => c,
                    Err(err) => {
                        send_error(
                            index,
                            &err,
                            usage(reason_tokens, completion_tokens, tokens_per_second),
                        );
                        return;
                    }
                };

                if capture.over_budget {
                    break;
                }

                match capture.disposition {
                    ChannelDisposition::Reasoning => {
                        reason_flag = 1;
                        continue;
                    }
                    ChannelDisposition::Completion => {
                        reason_flag = 0;
                        continue;
                    }
                    ChannelDisposition::ToolCall(json) => {
                        tool_flag = true;
                        completion_tokens += src.count_tokens(&json);
                        output_tokens = reason_tokens + completion_tokens;
                        tool_content.push_str(&json);
                        break;
                    }
                    ChannelDisposition::Unknown(header) => {
                        send_error(
                            index,
                            &Error::internal(format!("unknown channel type: {header}")),
                            usage(reason_tokens, completion_tokens, tokens_per_second),
                        );
                        return;
                    }
                }
            }

            TAG_END => {
                let capture = match tooling::consume_channel_end(src) {
                    Ok(c) => c,
                    Err(err) => {
                        send_error(
                            index,
                            &err,
                            usage(reason_tokens, completion_tokens, tokens_per_second),
                        );
                        return;
                    }
                };

                reason_flag = 0;
                if capture.hit_eog {
                    break;
                }
                continue;
            }

            _ => {}
        }

        // ---------------------------------------------------------------------
        // At the start of a region there may be an extra linefeed to drop.

        if is_unnecessary_crlf(reason_flag, output_flag, &piece.text) {
            continue;
        }

        if stop.push(&piece.text) {
            break;
        }

        // ---------------------------------------------------------------------
        // Reasoning or completion content to deliver and accumulate.

        match reason_flag {
            0 => {
                completion_tokens += piece.tokens;
                output_flag += 1;
            }
            _ => {
                reason_tokens += piece.tokens;
                reason_flag += 1;
            }
        }
        output_tokens = reason_tokens + completion_tokens;
        tokens_per_second = output_tokens as f64 / started.elapsed().as_secs_f64();

        if !first_token_seen {
            metrics().add_time_to_first_token(started.elapsed());
            first_token_seen = true;
        }

        let delta = ChatResponse::delta(
            stream.id,
            stream.object,
            stream.model_name,
            index,
            &piece.text,
            reason_flag > 0,
            usage(reason_tokens, completion_tokens, tokens_per_second),
        );

        // The consumer dropping the stream ends it immediately.
        if tx.blocking_send(delta).is_err() {
            return;
        }
        emitted_at_index = true;

        match reason_flag {
            0 => final_content.push_str(&piece.text),
            _ => final_reasoning.push_str(&piece.text),
        }
    }

    // -------------------------------------------------------------------------
    // Terminal response with the final tally.

    let tool_calls = if tool_flag {
        tooling::parse_tool_calls(&tool_content, stream.tools)
    } else {
        Vec::new()
    };

    if emitted_at_index {
        index += 1;
    }

    let u = usage(reason_tokens, completion_tokens, tokens_per_second);
    metrics().add_chat_completions_usage(&u);

    let _ = tx.blocking_send(ChatResponse::complete(
        stream.id,
        stream.object,
        stream.model_name,
        index.max(1),
        final_content,
        final_reasoning,
        tool_calls,
        u,
    ));
}

struct PrefillResult {
    input_tokens: usize,
    n_past: i32,
}

/// Decode the prompt into the context. For vision, the prompt's markers are
/// expanded through the multimodal helper, serialized per model because the
/// helper is not thread-safe.
fn prefill(
    model: &Model,
    ctx: &mut LlamaContext<'_>,
    req: &StreamParams,
) -> Result<PrefillResult> {
    let tokens = model.tokenize(&req.prompt, true)?;
    if tokens.is_empty() {
        return Err(Error::invalid("prompt tokenized to an empty sequence"));
    }
    let input_tokens = tokens.len();

    let started = Instant::now();

    if req.object == OBJECT_VISION {
        let mctx = model.media_context()?;

        let mut bitmaps = Vec::with_capacity(req.media.len());
        for buf in &req.media {
            let bitmap = MtmdBitmap::init_from_buf(&mctx, buf)
                .map_err(|e| Error::internal(format!("unable to load media: {e}")))?;
            bitmaps.push(bitmap);
        }

        let input = MtmdInputText {
            text: req.prompt.clone(),
            add_special: true,
            parse_special: true,
        };

        let refs: Vec<&MtmdBitmap> = bitmaps.iter().collect();
        let chunks = mctx
            .tokenize(input, &refs)
            .map_err(|e| Error::internal(format!("media tokenization failed: {e}")))?;

        let n_batch = model.config().context.batch_size as i32;

        let n_past = {
            let _serial = model.media_prefill_lock();
            chunks
                .eval_chunks(&mctx, ctx, 0, 0, n_batch, true)
                .map_err(|e| Error::internal(format!("media prefill failed: {e}")))?
        };

        metrics().add_prefill_media_time(started.elapsed());

        return Ok(PrefillResult {
            input_tokens,
            n_past,
        });
    }

    let n_batch = model.config().context.batch_size.max(1) as usize;
    let seq_count = model.config().context.seq_count.max(1) as i32;
    let mut batch = LlamaBatch::new(n_batch, seq_count);
    let last = tokens.len() - 1;

    for (chunk_index, chunk) in tokens.chunks(n_batch).enumerate() {
        batch.clear();
        let offset = chunk_index * n_batch;

        for (i, token) in chunk.iter().enumerate() {
            let pos = offset + i;
            batch
                .add(*token, pos as i32, &[0], pos == last)
                .map_err(|e| Error::internal(format!("batch add: {e}")))?;
        }

        ctx.decode(&mut batch)
            .map_err(|e| Error::internal(format!("decode prompt batch: {e}")))?;
    }

    metrics().add_prefill_non_media_time(started.elapsed());

    Ok(PrefillResult {
        input_tokens,
        n_past: tokens.len() as i32,
    })
}

/// Drop the linefeed the model emits right after entering a region: the
/// first piece of reasoning, or the first piece of completion output.
fn is_unnecessary_crlf(reason_flag: u32, output_flag: u32, content: &str) -> bool {
    if reason_flag == 1 && content == "\n" {
        return true;
    }

    if reason_flag == 0 && output_flag == 0 && (content == "\n" || content == "\n\n") {
        return true;
    }

    false
}

/// Adapts the native engine into a source of complete UTF-8 pieces. A token
/// whose bytes end mid code point is buffered until the sequence completes.
struct EngineSource<'c, 'm> {
    cancel: CancelToken,
    model: &'m Model,
    ctx: &'c mut LlamaContext<'m>,
    sampler: LlamaSampler,
    batch: LlamaBatch,
    n_cur: i32,
    utf8: encoding_rs::Decoder,
}

impl PieceSource for EngineSource<'_, '_> {
    fn next_piece(&mut self) -> Result<Option<Piece>> {
        let mut text = String::new();
        let mut tokens = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                let cause = self
                    .cancel
                    .cause()
                    .unwrap_or_else(|| "cancelled".to_string());
                return Err(Error::Cancelled(cause));
            }

            let token = self.sampler.sample(self.ctx, -1);
            self.sampler.accept(token);

            if self.model.is_eog(token) {
                return Ok(None);
            }

            let bytes = self.model.token_bytes(token)?;
            if bytes.is_empty() {
                // An empty piece ends generation like EOG does.
                return Ok(None);
            }
            tokens += 1;

            text.reserve(bytes.len() * 3);
            let _ = self.utf8.decode_to_string(&bytes, &mut text, false);

            // Advance the context with the sampled token.
            self.batch.clear();
            self.batch
                .add(token, self.n_cur, &[0], true)
                .map_err(|e| Error::internal(format!("batch add: {e}")))?;
            self.ctx
                .decode(&mut self.batch)
                .map_err(|e| Error::internal(format!("decode: {e}")))?;
            self.n_cur += 1;

            if !text.is_empty() {
                return Ok(Some(Piece { text, tokens }));
            }
            // Partial UTF-8 sequence: keep sampling.
        }
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.model.tokenize(text, true).map(|t| t.len()).unwrap_or(0)
    }
}
