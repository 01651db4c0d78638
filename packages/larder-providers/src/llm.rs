use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{Error, Result};

/// Sends a single-turn chat completion and returns the assistant's text.
pub async fn generate(
	cfg: &larder_config::LlmProviderConfig,
	prompt: &str,
	max_tokens: u32,
	temperature: f32,
) -> Result<String> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = serde_json::json!({
		"model": cfg.model,
		"temperature": temperature,
		"max_tokens": max_tokens,
		"messages": [
			{ "role": "user", "content": prompt },
		],
	});
	let res = client
		.post(&url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_completion_text(json)
}

fn parse_completion_text(json: Value) -> Result<String> {
	json.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|msg| msg.get("content"))
		.and_then(|c| c.as_str())
		.map(str::to_string)
		.ok_or_else(|| Error::InvalidResponse {
			message: "Completion response is missing message content.".to_string(),
		})
}
