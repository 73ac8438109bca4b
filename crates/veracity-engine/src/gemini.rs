use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use veracity_contracts::records::{
    AnalysisResult, ChatMessage, Classification, HighlightImage, ImageFile,
};

use crate::config::{ResolvedModels, ServiceConfig};
use crate::service::{AnalysisService, ChatSession};
use crate::truncate_text;
use crate::upload::{inline_part, prepare_upload};

const ANALYSIS_INSTRUCTION: &str = "You are a forensic image analyst. Decide whether this image is an authentic photograph or was generated or substantially altered by AI. Inspect lighting and shadows, skin and hair texture, hands and fingers, text and signage, reflections, background coherence and sensor noise. Respond with JSON only: {\"classification\": \"REAL\" | \"AI_GENERATED\" | \"UNCERTAIN\", \"reasoning\": \"<concise explanation citing the visual evidence>\"}.";

#[derive(Debug, Clone)]
struct GeminiTransport {
    api_base: String,
    http: HttpClient,
    timeout: Duration,
    max_retries: usize,
    retry_backoff_s: f64,
}

impl GeminiTransport {
    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn generate(&self, model: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self.post_with_transport_retries(&endpoint, api_key, payload)?;
        response_json_or_error("Gemini", response)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        for attempt in 0..=self.max_retries {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(self.timeout)
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw).context("Gemini request failed");
                    if !is_retryable_transport_error(&err) || attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay_s = self.retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        bail!("Gemini request failed after {} attempts", self.max_retries + 1)
    }
}

pub struct GeminiService {
    config: ServiceConfig,
    models: ResolvedModels,
    transport: GeminiTransport,
}

impl GeminiService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let models = config.resolve_models("gemini")?;
        let transport = GeminiTransport {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            http: HttpClient::builder()
                .build()
                .context("failed to build HTTP client")?,
            timeout: config.request_timeout(),
            max_retries: config.transport_retries,
            retry_backoff_s: config.retry_backoff_s,
        };
        Ok(Self {
            config,
            models,
            transport,
        })
    }
}

impl AnalysisService for GeminiService {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, image: &ImageFile) -> Result<AnalysisResult> {
        let api_key = self.config.require_api_key()?;
        let (bytes, mime_type) = prepare_upload(image, self.config.upload_max_dim);
        let payload = analysis_payload(&bytes, &mime_type);
        let response = self
            .transport
            .generate(&self.models.analysis, api_key, &payload)?;
        parse_analysis_text(&extract_text(&response))
    }

    fn highlight(&self, image: &ImageFile, reasoning: &str) -> Result<HighlightImage> {
        let api_key = self.config.require_api_key()?;
        let payload = highlight_payload(image, reasoning);
        let response = self
            .transport
            .generate(&self.models.highlight, api_key, &payload)?;
        extract_first_image(&response)?.context("Gemini returned no image")
    }

    fn create_chat(&self, priming: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>> {
        let api_key = self.config.require_api_key()?.to_string();
        Ok(Box::new(GeminiChatSession {
            transport: self.transport.clone(),
            model: self.models.chat.clone(),
            api_key,
            turns: priming,
        }))
    }
}

struct GeminiChatSession {
    transport: GeminiTransport,
    model: String,
    api_key: String,
    turns: Vec<ChatMessage>,
}

impl ChatSession for GeminiChatSession {
    fn send(&mut self, text: &str) -> Result<String> {
        let mut contents: Vec<Value> = self.turns.iter().map(turn_content).collect();
        contents.push(turn_content(&ChatMessage::user(text)));
        let response = self
            .transport
            .generate(&self.model, &self.api_key, &json!({ "contents": contents }))?;
        let reply = extract_text(&response);
        if reply.is_empty() {
            bail!("Gemini returned an empty reply");
        }
        self.turns.push(ChatMessage::user(text));
        self.turns.push(ChatMessage::model(reply.clone()));
        Ok(reply)
    }
}

fn turn_content(turn: &ChatMessage) -> Value {
    json!({
        "role": turn.role.as_str(),
        "parts": [{ "text": turn.content }],
    })
}

fn analysis_payload(bytes: &[u8], mime_type: &str) -> Value {
    let classifications: Vec<&str> = Classification::ALL
        .iter()
        .map(Classification::as_str)
        .collect();
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                inline_part(bytes, mime_type),
                { "text": ANALYSIS_INSTRUCTION },
            ],
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": {
                    "classification": { "type": "STRING", "enum": classifications },
                    "reasoning": { "type": "STRING" },
                },
                "required": ["classification", "reasoning"],
            },
        },
    })
}

fn highlight_payload(image: &ImageFile, reasoning: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                inline_part(image.bytes(), &image.mime_type),
                { "text": highlight_instruction(reasoning) },
            ],
        }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"],
        },
    })
}

fn highlight_instruction(reasoning: &str) -> String {
    format!(
        "Return an edited copy of this image in which every region showing signs of AI generation is outlined with a bright red circle or box. Do not change anything else in the image. Use this analysis to locate the artifacts:\n\n{}",
        reasoning.trim()
    )
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn candidate_parts(response: &Value) -> Vec<Value> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn extract_text(response: &Value) -> String {
    candidate_parts(response)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}

fn extract_first_image(response: &Value) -> Result<Option<HighlightImage>> {
    for part in candidate_parts(response) {
        let inline = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        return Ok(Some(HighlightImage::new(mime_type, bytes)));
    }
    Ok(None)
}

fn parse_analysis_text(text: &str) -> Result<AnalysisResult> {
    let Some(object) = extract_json_object_from_text(text) else {
        bail!("Gemini returned no analysis JSON: {}", truncate_text(text, 200));
    };
    let classification = object
        .get("classification")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse::<Classification>()?;
    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if reasoning.is_empty() {
        bail!("Gemini analysis is missing reasoning");
    }
    Ok(AnalysisResult::new(classification, reasoning))
}

fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    if !(raw.starts_with("```") && raw.ends_with("```")) {
        return raw.to_string();
    }
    let lines: Vec<&str> = raw.lines().collect();
    if lines.len() < 2 {
        return raw.to_string();
    }
    let mut body = lines[1..lines.len() - 1].join("\n").trim().to_string();
    if body.to_ascii_lowercase().starts_with("json") {
        body = body[4..].trim().to_string();
    }
    body
}

fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.trim().is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    for candidate in candidates {
        if let Ok(parsed) = serde_json::from_str::<Value>(&candidate) {
            if let Some(object) = parsed.as_object() {
                return Some(object.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(config: ServiceConfig) -> GeminiService {
        GeminiService::new(config).unwrap()
    }

    #[test]
    fn endpoint_prefixes_models_path() {
        let gemini = service(ServiceConfig {
            api_base: "https://example.test/v1beta/".to_string(),
            ..ServiceConfig::default()
        });
        assert_eq!(
            gemini.transport.endpoint_for_model("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            gemini.transport.endpoint_for_model("models/custom"),
            "https://example.test/v1beta/models/custom:generateContent"
        );
    }

    #[test]
    fn every_operation_requires_the_api_key() {
        let gemini = service(ServiceConfig::default());
        let image = ImageFile::new("a.png", "image/png", vec![1, 2, 3]);
        let analyze = gemini.analyze(&image).err().map(|err| err.to_string());
        assert_eq!(analyze.as_deref(), Some("API key not configured"));
        let highlight = gemini
            .highlight(&image, "reasoning")
            .err()
            .map(|err| err.to_string());
        assert_eq!(highlight.as_deref(), Some("API key not configured"));
        let chat = gemini.create_chat(Vec::new()).err().map(|err| err.to_string());
        assert_eq!(chat.as_deref(), Some("API key not configured"));
    }

    #[test]
    fn analysis_payload_requests_schema_constrained_json() {
        let payload = analysis_payload(&[1, 2], "image/jpeg");
        let config = &payload["generationConfig"];
        assert_eq!(config["responseMimeType"], "application/json");
        assert_eq!(
            config["responseSchema"]["properties"]["classification"]["enum"],
            json!(["REAL", "AI_GENERATED", "UNCERTAIN"])
        );
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert!(parts[1]["text"].as_str().unwrap().contains("AI_GENERATED"));
    }

    #[test]
    fn highlight_payload_embeds_reasoning_and_source_bytes() {
        let image = ImageFile::new("a.webp", "image/webp", vec![9, 9]);
        let payload = highlight_payload(&image, "  warped fingers  ");
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/webp");
        assert!(parts[1]["text"]
            .as_str()
            .unwrap()
            .ends_with("\n\nwarped fingers"));
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE", "TEXT"])
        );
    }

    #[test]
    fn parse_analysis_accepts_fenced_json() -> anyhow::Result<()> {
        let parsed = parse_analysis_text(
            "```json\n{\"classification\": \"AI_GENERATED\", \"reasoning\": \"melted text\"}\n```",
        )?;
        assert_eq!(parsed.classification, Classification::AiGenerated);
        assert_eq!(parsed.reasoning, "melted text");
        Ok(())
    }

    #[test]
    fn parse_analysis_rejects_unknown_classification_or_blank_reasoning() {
        assert!(parse_analysis_text(r#"{"classification":"MAYBE","reasoning":"x"}"#).is_err());
        assert!(parse_analysis_text(r#"{"classification":"REAL","reasoning":"  "}"#).is_err());
        assert!(parse_analysis_text("no json here").is_err());
    }

    #[test]
    fn extract_text_joins_candidate_parts() {
        let response = json!({
            "candidates": [{
                "content": { "parts": [{ "text": " Yes, " }, { "text": "92% confidence." }] }
            }]
        });
        assert_eq!(extract_text(&response), "Yes,\n92% confidence.");
    }

    #[test]
    fn extract_first_image_decodes_inline_data() -> anyhow::Result<()> {
        let response = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here you go" },
                    { "inlineData": { "mimeType": "image/png", "data": "AQID" } }
                ] }
            }]
        });
        let image = extract_first_image(&response)?.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert!(extract_first_image(&json!({ "candidates": [] }))?.is_none());
        Ok(())
    }

    #[test]
    fn chat_session_carries_priming_turns() -> anyhow::Result<()> {
        let gemini = service(ServiceConfig {
            api_key: Some("k".to_string()),
            ..ServiceConfig::default()
        });
        let priming = vec![ChatMessage::user("context"), ChatMessage::model("ok")];
        let session = GeminiChatSession {
            transport: gemini.transport.clone(),
            model: gemini.models.chat.clone(),
            api_key: "k".to_string(),
            turns: priming.clone(),
        };
        let contents: Vec<Value> = session.turns.iter().map(turn_content).collect();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "ok");
        assert!(gemini.create_chat(priming).is_ok());
        Ok(())
    }
}
