//! Tag handling for the decoder: think/tool-call markers, channel headers,
//! and structured tool-call parsing.

use kronk_api::{tool_status, Result, ToolCall, ToolDef};
use serde::Deserialize;

pub(crate) const TAG_THINK_OPEN: &str = "<think>";
pub(crate) const TAG_THINK_CLOSE: &str = "</think>";
pub(crate) const TAG_TOOL_OPEN: &str = "<tool_call>";
pub(crate) const TAG_TOOL_CLOSE: &str = "</tool_call>";
pub(crate) const TAG_CHANNEL: &str = "<|channel|>";
pub(crate) const TAG_MESSAGE: &str = "<|message|>";
pub(crate) const TAG_END: &str = "<|end|>";

/// One complete detokenized piece plus the tokens it took to produce.
#[derive(Debug, Clone)]
pub(crate) struct Piece {
    pub text: String,
    pub tokens: usize,
}

/// The decoder's view of the token stream. Implementations deliver complete
/// UTF-8 pieces only; partial sequences are buffered internally.
pub(crate) trait PieceSource {
    /// The next piece, or None at end of generation.
    fn next_piece(&mut self) -> Result<Option<Piece>>;

    /// Token count of a text span under this source's tokenizer, used to
    /// charge collected tool-call content against the usage tally.
    fn count_tokens(&self, text: &str) -> usize;
}

/// Result of running an in-tag collector.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub text: String,
    pub tokens: usize,
    pub hit_eog: bool,
    pub over_budget: bool,
}

/// Where a channel header sends the stream next.
#[derive(Debug)]
pub(crate) enum ChannelDisposition {
    Reasoning,
    Completion,
    /// Synthesized `{"name": …, "arguments": …}` JSON.
    ToolCall(String),
    Unknown(String),
}

#[derive(Debug)]
pub(crate) struct ChannelCapture {
    pub disposition: ChannelDisposition,
    pub tokens: usize,
    pub over_budget: bool,
}

/// Collect tool-call content up to `</tool_call>`. An EOG before the closing
/// tag keeps whatever was collected; the parser will grade it.
pub(crate) fn collect_tool_call(src: &mut dyn PieceSource, budget: usize) -> Result<Capture> {
    let mut capture = Capture::default();

    loop {
        if capture.tokens > budget {
            capture.over_budget = true;
            return Ok(capture);
        }

        let Some(piece) = src.next_piece()? else {
            capture.hit_eog = true;
            break;
        };
        capture.tokens += piece.tokens;

        if piece.text == TAG_TOOL_CLOSE {
            break;
        }

        capture.text.push_str(&piece.text);
    }

    capture.text = capture.text.trim_matches('\n').to_string();
    Ok(capture)
}

/// Collect a channel header up to `<|message|>` and resolve its disposition.
/// For commentary headers the tool arguments are collected here as well, up
/// to end-of-generation or `<|end|>`.
pub(crate) fn collect_channel(src: &mut dyn PieceSource, budget: usize) -> Result<ChannelCapture> {
    let mut header = String::new();
    let mut tokens = 0usize;

    loop {
        if tokens > budget {
            return Ok(ChannelCapture {
                disposition: ChannelDisposition::Unknown(header),
                tokens,
                over_budget: true,
            });
        }

        let Some(piece) = src.next_piece()? else {
            return Ok(ChannelCapture {
                disposition: ChannelDisposition::Unknown(header),
                tokens,
                over_budget: false,
            });
        };
        tokens += piece.tokens;

        if piece.text == TAG_MESSAGE {
            break;
        }

        header.push_str(&piece.text);
    }

    let header = header.trim().to_string();

    let disposition = match header.as_str() {
        "analysis" => ChannelDisposition::Reasoning,
        "final" => ChannelDisposition::Completion,
        _ if header.starts_with("commentary") => {
            let mut args = String::new();

            loop {
                if tokens > budget {
                    return Ok(ChannelCapture {
                        disposition: ChannelDisposition::Unknown(header),
                        tokens,
                        over_budget: true,
                    });
                }

                let Some(piece) = src.next_piece()? else {
                    break;
                };
                tokens += piece.tokens;

                if piece.text == TAG_END {
                    break;
                }

                args.push_str(&piece.text);
            }

            ChannelDisposition::ToolCall(synthesize_tool_call(&header, args.trim()))
        }
        _ => ChannelDisposition::Unknown(header),
    };

    Ok(ChannelCapture {
        disposition,
        tokens,
        over_budget: false,
    })
}

/// Consume the two pieces following `<|end|>` (`<|start|>` and `assistant`).
pub(crate) fn consume_channel_end(src: &mut dyn PieceSource) -> Result<Capture> {
    let mut capture = Capture::default();

    for _ in 0..2 {
        let Some(piece) = src.next_piece()? else {
            capture.hit_eog = true;
            break;
        };
        capture.tokens += piece.tokens;
    }

    Ok(capture)
}

/// Build the `{"name": …, "arguments": …}` form from a commentary header
/// (`commentary to=functions.get_weather <|constrain|>json`) and its raw
/// JSON arguments.
fn synthesize_tool_call(header: &str, args: &str) -> String {
    let name = extract_function_name(header).unwrap_or_default();

    let arguments: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(args).unwrap_or_default();

    serde_json::json!({
        "name": name,
        "arguments": arguments,
    })
    .to_string()
}

/// Pull the function name out of a `to=functions.<name>` header field.
pub(crate) fn extract_function_name(header: &str) -> Option<String> {
    for field in header.split_whitespace() {
        let Some((_, after)) = field.split_once('=') else {
            continue;
        };

        let mut parts = after.split('.');
        let namespace = parts.next()?;
        let name = parts.next()?;
        if parts.next().is_some() || namespace != "functions" || name.is_empty() {
            return None;
        }

        return Some(name.to_string());
    }

    None
}

#[derive(Deserialize, Default)]
struct ParsedCall {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: serde_json::Map<String, serde_json::Value>,
}

/// Parse accumulated tool-call content (one JSON object per line) into
/// structured calls. Every call gets a fresh UUID; failures are graded, not
/// fatal: 0 = ok, 1 = missing, 2 = malformed, 3 = unknown tool.
pub(crate) fn parse_tool_calls(content: &str, tools: &[ToolDef]) -> Vec<ToolCall> {
    if content.trim().is_empty() {
        return vec![ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            status: tool_status::MISSING,
            error: Some("response missing".to_string()),
            ..Default::default()
        }];
    }

    let mut calls = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut call = ToolCall {
            id: uuid::Uuid::new_v4().to_string(),
            raw: line.to_string(),
            ..Default::default()
        };

        match serde_json::from_str::<ParsedCall>(line) {
            Ok(parsed) => {
                call.name = parsed.name;
                call.arguments = parsed.arguments;

                let known = tools.is_empty()
                    || tools.iter().any(|t| t.function.name == call.name);
                if !known {
                    call.status = tool_status::UNKNOWN_TOOL;
                    call.error = Some(format!("unknown tool: {}", call.name));
                }
            }
            Err(err) => {
                call.status = tool_status::MALFORMED;
                call.error = Some(err.to_string());
            }
        }

        calls.push(call);
    }

    calls
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted source: each entry is one piece costing one token.
    pub(crate) struct ScriptSource {
        pieces: VecDeque<String>,
    }

    impl ScriptSource {
        pub(crate) fn new(pieces: &[&str]) -> Self {
            Self {
                pieces: pieces.iter().map(|p| p.to_string()).collect(),
            }
        }
    }

    impl PieceSource for ScriptSource {
        fn next_piece(&mut self) -> Result<Option<Piece>> {
            Ok(self.pieces.pop_front().map(|text| Piece { text, tokens: 1 }))
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count().max(1)
        }
    }

    #[test]
    fn tool_call_collects_until_closing_tag() {
        let mut src = ScriptSource::new(&["\n", "{\"name\":", "\"get_weather\"}", "\n", "</tool_call>", "after"]);

        let capture = collect_tool_call(&mut src, 100).unwrap();
        assert_eq!(capture.text, "{\"name\":\"get_weather\"}");
        assert_eq!(capture.tokens, 5);
        assert!(!capture.hit_eog);
    }

    #[test]
    fn tool_call_survives_eog_before_close() {
        let mut src = ScriptSource::new(&["{\"name\":"]);

        let capture = collect_tool_call(&mut src, 100).unwrap();
        assert!(capture.hit_eog);
        assert_eq!(capture.text, "{\"name\":");
    }

    #[test]
    fn tool_call_respects_the_budget() {
        let mut src = ScriptSource::new(&["a", "b", "c", "d", "e", "f"]);

        let capture = collect_tool_call(&mut src, 2).unwrap();
        assert!(capture.over_budget);
    }

    #[test]
    fn channel_analysis_and_final_headers() {
        let mut src = ScriptSource::new(&["analysis", "<|message|>"]);
        let capture = collect_channel(&mut src, 100).unwrap();
        assert!(matches!(capture.disposition, ChannelDisposition::Reasoning));

        let mut src = ScriptSource::new(&["final", "<|message|>"]);
        let capture = collect_channel(&mut src, 100).unwrap();
        assert!(matches!(capture.disposition, ChannelDisposition::Completion));
    }

    #[test]
    fn channel_commentary_synthesizes_a_tool_call() {
        let mut src = ScriptSource::new(&[
            "commentary",
            " to=functions.get_weather",
            " <|constrain|>json",
            "<|message|>",
            "{\"location\":",
            "\"London\"}",
        ]);

        let capture = collect_channel(&mut src, 100).unwrap();
        let ChannelDisposition::ToolCall(json) = capture.disposition else {
            panic!("expected tool call disposition");
        };

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "get_weather");
        assert_eq!(value["arguments"]["location"], "London");
    }

    #[test]
    fn channel_commentary_stops_at_end_tag() {
        let mut src = ScriptSource::new(&[
            "commentary",
            " to=functions.lookup",
            "<|message|>",
            "{}",
            "<|end|>",
            "trailing",
        ]);

        let capture = collect_channel(&mut src, 100).unwrap();
        assert!(matches!(capture.disposition, ChannelDisposition::ToolCall(_)));

        // The trailing piece was not consumed.
        assert_eq!(src.next_piece().unwrap().unwrap().text, "trailing");
    }

    #[test]
    fn unknown_channel_headers_are_reported() {
        let mut src = ScriptSource::new(&["mystery", "<|message|>"]);
        let capture = collect_channel(&mut src, 100).unwrap();
        match capture.disposition {
            ChannelDisposition::Unknown(header) => assert_eq!(header, "mystery"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn channel_end_consumes_start_and_role() {
        let mut src = ScriptSource::new(&["<|start|>", "assistant", "next"]);
        let capture = consume_channel_end(&mut src).unwrap();
        assert_eq!(capture.tokens, 2);

        assert_eq!(src.next_piece().unwrap().unwrap().text, "next");
    }

    #[test]
    fn function_name_extraction() {
        assert_eq!(
            extract_function_name("commentary to=functions.get_weather <|constrain|>json"),
            Some("get_weather".to_string())
        );
        assert_eq!(extract_function_name("commentary to=tools.get_weather"), None);
        assert_eq!(extract_function_name("commentary"), None);
        assert_eq!(extract_function_name("commentary to=functions.a.b"), None);
    }

    #[test]
    fn parse_grades_tool_calls() {
        let tools = vec![kronk_api::ToolDef::function("get_weather", "weather")];

        let calls = parse_tool_calls("{\"name\":\"get_weather\",\"arguments\":{\"location\":\"London, England\"}}", &tools);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, tool_status::OK);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments["location"], "London, England");
        assert!(!calls[0].id.is_empty());

        // The raw text re-parses to the structured form.
        let reparsed: serde_json::Value = serde_json::from_str(&calls[0].raw).unwrap();
        assert_eq!(reparsed["name"], "get_weather");

        let calls = parse_tool_calls("", &tools);
        assert_eq!(calls[0].status, tool_status::MISSING);

        let calls = parse_tool_calls("{not json", &tools);
        assert_eq!(calls[0].status, tool_status::MALFORMED);
        assert!(calls[0].error.is_some());

        let calls = parse_tool_calls("{\"name\":\"launch_rockets\"}", &tools);
        assert_eq!(calls[0].status, tool_status::UNKNOWN_TOOL);
    }

    #[test]
    fn parse_handles_multiple_calls_per_response() {
        let content = "{\"name\":\"a\"}\n{\"name\":\"b\"}";
        let calls = parse_tool_calls(content, &[]);
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
    }
}
