//! LLM-backed field reasoning.
//!
//! One request per extraction: the cleaned document text, a short region
//! summary, and the names of the fields the deterministic rules could not
//! resolve. The response is constrained with a strict JSON Schema built from
//! those names, and parsed defensively anyway, because gateways and smaller
//! models still find ways to wrap JSON in prose.

use std::{collections::BTreeMap, sync::LazyLock, time::Duration};

use anyhow::anyhow;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, ResponseFormat, ResponseFormatJsonSchema,
    },
};
use async_trait::async_trait;
use clap::Args;
use regex::Regex;
use tokio::time;

use crate::prelude::*;

/// Document text sent to the model is truncated to this many characters.
const PROMPT_TEXT_CAP: usize = 6000;

/// LLM call options.
#[derive(Debug, Clone, Args)]
pub struct LlmOpts {
    /// An upper limit on the number of completion tokens to generate. This
    /// may help prevent runaway responses, but it may also cause incomplete
    /// results.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// The temperature to use for sampling, between 0.0 and 2.0. Defaults to
    /// the model's default.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// A timeout, in seconds, for the model to return a complete response.
    #[clap(long = "llm-timeout", default_value = "120")]
    pub timeout: u64,
}

impl Default for LlmOpts {
    fn default() -> Self {
        LlmOpts {
            max_completion_tokens: None,
            temperature: None,
            timeout: 120,
        }
    }
}

/// One reasoning request, borrowed from the session.
#[derive(Debug)]
pub struct ReasoningRequest<'a> {
    /// Cleaned aggregate OCR text.
    pub document_text: &'a str,
    /// Compact summary of the top regions, for layout context.
    pub region_summary: &'a str,
    /// The still-unresolved field names, in request order.
    pub field_names: &'a [String],
}

/// Interface to the field reasoning capability.
#[async_trait]
pub trait FieldReasoner: Send + Sync + 'static {
    /// Ask the model for values of the requested fields.
    ///
    /// The result contains only fields the model actually resolved; missing
    /// names mean "the model did not know".
    async fn infer_fields(
        &self,
        request: ReasoningRequest<'_>,
    ) -> Result<BTreeMap<String, String>>;
}

/// Field reasoner backed by an OpenAI-compatible `/chat/completions`
/// endpoint (usually a LiteLLM or Ollama gateway).
pub struct LlmFieldReasoner {
    client: Client<OpenAIConfig>,
    model: String,
    opts: LlmOpts,
}

impl LlmFieldReasoner {
    /// Create a reasoner from `OPENAI_API_KEY` / `OPENAI_API_BASE`.
    ///
    /// Fails when neither variable is set, so a missing key shows up at
    /// configuration time rather than mid-extraction.
    pub fn from_env(model: impl Into<String>, opts: LlmOpts) -> Result<LlmFieldReasoner> {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let api_base = std::env::var("OPENAI_API_BASE").ok();
        if api_key.is_none() && api_base.is_none() {
            return Err(anyhow!(
                "neither OPENAI_API_KEY nor OPENAI_API_BASE is set"
            ));
        }
        let mut client_config = OpenAIConfig::new();
        if let Some(api_key) = api_key {
            client_config = client_config.with_api_key(api_key);
        }
        if let Some(api_base) = api_base {
            client_config = client_config.with_api_base(api_base);
        }
        Ok(LlmFieldReasoner {
            client: Client::with_config(client_config),
            model: model.into(),
            opts,
        })
    }
}

#[async_trait]
impl FieldReasoner for LlmFieldReasoner {
    #[instrument(level = "debug", skip_all, fields(model = %self.model, field_count = request.field_names.len()))]
    async fn infer_fields(
        &self,
        request: ReasoningRequest<'_>,
    ) -> Result<BTreeMap<String, String>> {
        // Build our JSON Schema options.
        let json_schema = ResponseFormatJsonSchema {
            name: "extracted_fields".to_owned(),
            schema: Some(fields_schema(request.field_names)),
            strict: Some(true),
            description: None,
        };

        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt())
                .build()
                .context("Error building system message")?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt(&request))
                .build()
                .context("Error building user message")?
                .into(),
        ];

        let mut req = CreateChatCompletionRequestArgs::default();
        req.model(self.model.clone())
            .messages(messages)
            .response_format(ResponseFormat::JsonSchema { json_schema })
            .store(false);
        if let Some(max_completion_tokens) = self.opts.max_completion_tokens {
            req.max_completion_tokens(max_completion_tokens);
        }
        if let Some(temperature) = self.opts.temperature {
            req.temperature(temperature);
        }
        let req = req.build().context("Error building chat request")?;
        trace!(?req, "Chat request");

        // Call the model, bounded by our timeout.
        let chat = self.client.chat();
        let chat_future = chat.create_byot(req);
        let chat_result: Value =
            match time::timeout(Duration::from_secs(self.opts.timeout), chat_future)
                .await
            {
                Ok(result) => result.context("chat completion request failed")?,
                Err(_) => {
                    return Err(anyhow!(
                        "chat completion timed out after {}s",
                        self.opts.timeout
                    ));
                }
            };
        debug!(%chat_result, "Chat response");
        let response: CreateChatCompletionResponse =
            serde_json::from_value(chat_result)
                .context("Error parsing chat response")?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("no choices in chat response"))?;
        let content = choice.message.content.as_deref().unwrap_or_default();
        let reply = salvage_json_reply(content)?;
        Ok(collect_string_fields(&reply, request.field_names))
    }
}

/// Strict response schema: every requested field, string or null, nothing
/// else.
fn fields_schema(field_names: &[String]) -> Value {
    let mut properties = serde_json::Map::new();
    for name in field_names {
        properties.insert(name.clone(), json!({ "type": ["string", "null"] }));
    }
    json!({
        "title": "ExtractedFields",
        "type": "object",
        "properties": properties,
        "required": field_names,
        "additionalProperties": false,
    })
}

fn system_prompt() -> String {
    "You are a field extraction system reading OCR text from a scanned \
     engineering form or checklist. Treat the text as a structured document, \
     not prose: region markers like [REGION:Table|3|bbox:...] tell you what \
     kind of area the following lines came from, and labels and their values \
     are often split across lines.\n\
     \n\
     Rules:\n\
     1) Never invent data; answer null for a field you cannot find.\n\
     2) Preserve exact formatting, including leading zeros and units.\n\
     3) CH followed by digits is a Structure ID; P##-P## is a Span ID.\n\
     4) Prefer a value from the same region as its label.\n\
     5) Output JSON only."
        .to_owned()
}

fn user_prompt(request: &ReasoningRequest<'_>) -> String {
    let text = truncate_chars(request.document_text, PROMPT_TEXT_CAP);
    let fields = request
        .field_names
        .iter()
        .map(|name| format!("- {name}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "OCR text (truncated):\n{text}\n\n\
         Region summary (top regions):\n{summary}\n\n\
         Example:\n\
         Input:\n\
         [1] Text: RFI No: 0000220949\\n[2] Text: CH211 P17-P18\n\
         Output JSON: {{\"RFI No\":\"0000220949\",\"Structure ID\":\"CH211\",\"Span ID\":\"P17-P18\"}}\n\n\
         Fields to extract:\n{fields}\n\n\
         Output only valid JSON mapping each field to its value.",
        summary = request.region_summary,
    )
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Trailing commas before a closing brace, which several models emit.
static TRAILING_OBJECT_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\}").expect("failed to compile regex"));

/// Trailing commas before a closing bracket.
static TRAILING_ARRAY_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*\]").expect("failed to compile regex"));

/// Pull a JSON object out of a model reply that may be wrapped in code
/// fences or prose, and repair the usual formatting quirks.
fn salvage_json_reply(content: &str) -> Result<Value> {
    let candidate = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    };
    let cleaned = candidate
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('\u{00a0}', " ");
    let cleaned = TRAILING_OBJECT_COMMA.replace_all(&cleaned, "}");
    let cleaned = TRAILING_ARRAY_COMMA.replace_all(&cleaned, "]");
    serde_json::from_str(&cleaned)
        .with_context(|| format!("model reply was not valid JSON: {content:?}"))
}

/// Keep the requested fields that came back with a usable value.
///
/// Strings are trimmed and empty ones dropped; bare numbers are accepted
/// since models sometimes unquote numeric ids. Everything else (null,
/// objects, extra keys) is ignored.
fn collect_string_fields(
    reply: &Value,
    field_names: &[String],
) -> BTreeMap<String, String> {
    let mut resolved = BTreeMap::new();
    for name in field_names {
        match reply.get(name) {
            Some(Value::String(s)) if !s.trim().is_empty() => {
                resolved.insert(name.clone(), s.trim().to_owned());
            }
            Some(Value::Number(n)) => {
                resolved.insert(name.clone(), n.to_string());
            }
            _ => {}
        }
    }
    resolved
}
