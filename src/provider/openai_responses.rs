//! OpenAI Responses API invoker (streaming).

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http::{bearer_headers, drain_sse_events, shared_client, status_to_error};
use super::{CompletionInvoker, CompletionRequest};
use crate::error::AgentError;
use crate::types::{ResponseItem, ResponseStream, Role, StreamEvent, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streams responses from `POST {base_url}/responses`.
#[derive(Debug, Clone)]
pub struct OpenAiResponsesInvoker {
    api_key: String,
    base_url: String,
}

impl OpenAiResponsesInvoker {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the JSON body for a streaming request.
    pub fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("model".into(), request.model.clone().into());
        obj.insert("instructions".into(), request.instructions.clone().into());
        obj.insert(
            "input".into(),
            Self::build_input_items(&request.input).into(),
        );
        obj.insert("stream".into(), true.into());

        if let Some(ref id) = request.previous_response_id {
            obj.insert("previous_response_id".into(), id.clone().into());
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                        "strict": false,
                    })
                })
                .collect();
            obj.insert("tools".into(), tools.into());
        }

        let settings = &request.settings;
        if let Some(t) = settings.temperature {
            obj.insert("temperature".into(), t.into());
        }
        if let Some(p) = settings.top_p {
            obj.insert("top_p".into(), p.into());
        }
        if let Some(max) = settings.max_output_tokens {
            obj.insert("max_output_tokens".into(), max.into());
        }
        if let Some(parallel) = settings.parallel_tool_calls {
            obj.insert("parallel_tool_calls".into(), parallel.into());
        }
        if let Some(effort) = settings.reasoning_effort {
            obj.insert(
                "reasoning".into(),
                serde_json::json!({ "effort": effort.to_string(), "summary": "auto" }),
            );
        }
        if let Some(ref user) = settings.user {
            obj.insert("user".into(), user.clone().into());
        }
        serde_json::Value::Object(obj)
    }

    fn build_input_items(items: &[ResponseItem]) -> Vec<serde_json::Value> {
        items
            .iter()
            .filter_map(|item| match item {
                // Loop-generated notices never go back to the model.
                ResponseItem::Message {
                    role: Role::System, ..
                } => None,
                ResponseItem::Message { role, content } => Some(serde_json::json!({
                    "type": "message",
                    "role": role,
                    "content": content,
                })),
                ResponseItem::FunctionCall {
                    name,
                    arguments,
                    call_id,
                } => Some(serde_json::json!({
                    "type": "function_call",
                    "call_id": call_id,
                    "name": name,
                    "arguments": arguments,
                })),
                ResponseItem::FunctionCallOutput { call_id, output } => Some(serde_json::json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output,
                })),
                ResponseItem::Reasoning { .. } => None,
            })
            .collect()
    }
}

/// Translate one SSE payload into zero or one stream event.
pub fn parse_sse_event(data: &str) -> Result<Option<StreamEvent>, AgentError> {
    let event: serde_json::Value = serde_json::from_str(data)?;
    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "response.created" => Ok(response_id(&event)
            .map(|response_id| StreamEvent::Created { response_id })),
        "response.output_item.done" => Ok(event
            .get("item")
            .and_then(parse_output_item)
            .map(StreamEvent::item)),
        "response.completed" => {
            let response_id = response_id(&event).ok_or_else(|| {
                AgentError::Stream("response.completed without response id".into())
            })?;
            let usage = event
                .get("response")
                .and_then(|r| r.get("usage"))
                .and_then(|u| {
                    let count = |key: &str| u32::try_from(u.get(key)?.as_u64()?).ok();
                    Some(Usage {
                        input_tokens: count("input_tokens")?,
                        output_tokens: count("output_tokens")?,
                        total_tokens: count("total_tokens")?,
                    })
                });
            Ok(Some(StreamEvent::Completed { response_id, usage }))
        }
        "response.incomplete" => {
            let reason = event
                .pointer("/response/incomplete_details/reason")
                .and_then(|r| r.as_str())
                .unwrap_or("unknown");
            if reason == "max_output_tokens" {
                Err(AgentError::ContextLengthExceeded(
                    "response hit max_output_tokens".into(),
                ))
            } else {
                Err(AgentError::Stream(format!("response incomplete: {reason}")))
            }
        }
        "response.failed" | "error" => {
            let error = event
                .pointer("/response/error")
                .or_else(|| event.get("error"))
                .unwrap_or(&event);
            let code = error.get("code").and_then(|c| c.as_str()).unwrap_or("");
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("response failed")
                .to_string();
            Err(match code {
                "rate_limit_exceeded" => AgentError::RateLimited {
                    retry_after_ms: None,
                    message: Some(message),
                },
                "context_length_exceeded" => AgentError::ContextLengthExceeded(message),
                "server_error" => AgentError::api(500, message),
                _ => AgentError::Stream(message),
            })
        }
        _ => Ok(None),
    }
}

fn response_id(event: &serde_json::Value) -> Option<String> {
    event
        .pointer("/response/id")
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

fn parse_output_item(item: &serde_json::Value) -> Option<ResponseItem> {
    match item.get("type").and_then(|t| t.as_str())? {
        "message" => {
            let text: String = item
                .get("content")
                .and_then(|c| c.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|part| {
                            part.get("type").and_then(|t| t.as_str()) == Some("output_text")
                        })
                        .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            Some(ResponseItem::assistant(text))
        }
        "function_call" => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(|v| v.as_str())?;
            let name = item.get("name").and_then(|v| v.as_str())?;
            let arguments = item
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            Some(ResponseItem::function_call(call_id, name, arguments))
        }
        "reasoning" => {
            let text: Vec<&str> = item
                .get("summary")
                .and_then(|s| s.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            Some(ResponseItem::Reasoning {
                text: text.join("\n"),
            })
        }
        _ => None,
    }
}

#[async_trait]
impl CompletionInvoker for OpenAiResponsesInvoker {
    fn name(&self) -> &str {
        "openai-responses"
    }

    async fn invoke(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, AgentError> {
        let body = Self::build_request_body(request);
        let url = format!("{}/responses", self.base_url);

        debug!(
            model = request.model.as_str(),
            previous_response_id = request.previous_response_id.as_deref().unwrap_or(""),
            input_items = request.input.len(),
            "OpenAI Responses invoke"
        );

        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let headers = resp.headers().clone();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &headers, &body_text));
        }

        Ok(sse_event_stream(resp.bytes_stream(), cancel))
    }
}

/// Turn a raw SSE byte stream into stream events, stopping at the first error.
pub fn sse_event_stream<S, B, E>(byte_stream: S, cancel: CancellationToken) -> ResponseStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<AgentError> + Send,
{
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(byte_stream);
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break; };
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(chunk.as_ref()),
                Err(e) => {
                    yield Err(e.into());
                    break;
                }
            }
            let payloads = match drain_sse_events(&mut buffer) {
                Ok(payloads) => payloads,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for data in payloads {
                if data == "[DONE]" {
                    continue;
                }
                match parse_sse_event(&data) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {}
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        }
    };

    Box::pin(stream)
}
