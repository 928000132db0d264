// 该文件是 DeepMID 项目的一部分。
// src/vision/groq.rs - Groq 云端 Chat Completions 后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  codec::EncodedImage,
  http_base,
  prompt::Prompt,
  query_param,
  vision::{BackendKind, GenerationParams, VisionBackend},
};

pub const DEFAULT_GROQ_MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";

#[derive(Error, Debug)]
pub enum GroqError {
  #[error("invalid backend url: {0}")]
  InvalidUrl(String),
  #[error("http error: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("service returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("malformed completion response: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("completion response has no choices")]
  NoChoices,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
  pub model: &'a str,
  pub messages: Vec<ChatMessage<'a>>,
  pub temperature: f32,
  pub max_completion_tokens: u32,
  pub top_p: f32,
  pub stream: bool,
  pub stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage<'a> {
  pub role: &'static str,
  pub content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentPart<'a> {
  Text { text: &'a str },
  ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub(crate) struct ImageUrl {
  pub url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
  message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
  #[serde(default)]
  content: Option<String>,
}

impl<'a> ChatCompletionRequest<'a> {
  pub(crate) fn new(
    model: &'a str,
    image: &EncodedImage,
    prompt: &'a Prompt,
    params: &GenerationParams,
  ) -> Self {
    ChatCompletionRequest {
      model,
      messages: vec![ChatMessage {
        role: "user",
        content: vec![
          ContentPart::Text {
            text: prompt.as_str(),
          },
          ContentPart::ImageUrl {
            image_url: ImageUrl {
              url: image.data_url(),
            },
          },
        ],
      }],
      temperature: params.temperature,
      max_completion_tokens: params.max_completion_tokens,
      top_p: 1.0,
      stream: false,
      stop: None,
    }
  }
}

pub struct GroqBuilder {
  base: String,
  model: String,
  api_key: Option<String>,
  timeout: Option<Duration>,
}

impl FromUrlWithScheme for GroqBuilder {
  const SCHEME: &'static str = "groq";
}

impl FromUrl for GroqBuilder {
  type Error = GroqError;

  /// `groq://api.groq.com/openai/v1?model=<model>`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !Self::scheme_matches(url.scheme()) {
      return Err(GroqError::InvalidUrl(format!(
        "expected scheme '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let base =
      http_base(url, true).ok_or_else(|| GroqError::InvalidUrl("missing host".to_string()))?;
    let timeout = match query_param(url, "timeout") {
      Some(value) => Some(Duration::from_secs(value.parse::<u64>().map_err(|_| {
        GroqError::InvalidUrl(format!("invalid timeout '{value}'"))
      })?)),
      None => None,
    };

    Ok(GroqBuilder {
      base,
      model: query_param(url, "model").unwrap_or_else(|| DEFAULT_GROQ_MODEL.to_string()),
      api_key: query_param(url, "api_key"),
      timeout,
    })
  }
}

impl GroqBuilder {
  pub fn api_key(mut self, api_key: Option<String>) -> Self {
    if api_key.is_some() {
      self.api_key = api_key;
    }
    self
  }

  pub fn build(self) -> Result<GroqClient, GroqError> {
    if self.api_key.is_none() {
      warn!("未配置 Groq API 金钥，云端分析请求将被拒绝");
    }

    let client = Client::builder().timeout(self.timeout).build()?;
    info!("云端视觉模型: {} @ {}", self.model, self.base);

    Ok(GroqClient {
      client,
      url: format!("{}/chat/completions", self.base),
      model: self.model,
      api_key: self.api_key,
    })
  }
}

pub struct GroqClient {
  client: Client,
  url: String,
  model: String,
  api_key: Option<String>,
}

impl std::fmt::Debug for GroqClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GroqClient")
      .field("url", &self.url)
      .field("model", &self.model)
      .finish_non_exhaustive()
  }
}

impl VisionBackend for GroqClient {
  type Error = GroqError;

  fn kind(&self) -> BackendKind {
    BackendKind::Groq
  }

  fn complete(
    &self,
    image: &EncodedImage,
    prompt: &Prompt,
    params: &GenerationParams,
  ) -> Result<String, Self::Error> {
    let request = ChatCompletionRequest::new(&self.model, image, prompt, params);
    debug!(
      "发送 Chat Completions 请求: model={}, temperature={}, max_completion_tokens={}",
      self.model, params.temperature, params.max_completion_tokens
    );

    let mut builder = self.client.post(&self.url).json(&request);
    if let Some(api_key) = &self.api_key {
      builder = builder.bearer_auth(api_key);
    }
    let response = builder.send()?;

    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
      return Err(GroqError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
    let choice = parsed.choices.into_iter().next().ok_or(GroqError::NoChoices)?;
    Ok(choice.message.content.unwrap_or_default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;
  use serde_json::json;

  #[test]
  fn test_request_wire_shape() {
    let image = crate::codec::encode_base64(&RgbImage::new(4, 4)).unwrap();
    let prompt = Prompt::custom("describe");
    let params = GenerationParams {
      temperature: 0.7,
      max_completion_tokens: 1024,
    };
    let request = ChatCompletionRequest::new("m", &image, &prompt, &params);
    let value = serde_json::to_value(&request).unwrap();

    assert_eq!(value["model"], "m");
    assert_eq!(value["max_completion_tokens"], 1024);
    assert_eq!(value["top_p"], 1.0);
    assert_eq!(value["stream"], false);
    assert_eq!(value["stop"], serde_json::Value::Null);
    assert_eq!(value["messages"][0]["role"], "user");
    assert_eq!(
      value["messages"][0]["content"][0],
      json!({"type": "text", "text": "describe"})
    );
    assert_eq!(value["messages"][0]["content"][1]["type"], "image_url");
    let url = value["messages"][0]["content"][1]["image_url"]["url"]
      .as_str()
      .unwrap();
    assert!(url.starts_with("data:image/jpeg;base64,"));
  }

  #[test]
  fn test_builder_defaults_model() {
    let url = Url::parse("groq://api.groq.com/openai/v1").unwrap();
    let builder = GroqBuilder::from_url(&url).unwrap();
    assert_eq!(builder.base, "https://api.groq.com/openai/v1");
    assert_eq!(builder.model, DEFAULT_GROQ_MODEL);
  }

  #[test]
  fn test_builder_reads_model_and_timeout() {
    let url =
      Url::parse("groq+http://localhost:9000/openai/v1?model=llava&timeout=30").unwrap();
    let builder = GroqBuilder::from_url(&url).unwrap();
    assert_eq!(builder.base, "http://localhost:9000/openai/v1");
    assert_eq!(builder.model, "llava");
    assert_eq!(builder.timeout, Some(Duration::from_secs(30)));
  }

  #[test]
  fn test_builder_rejects_other_scheme() {
    let url = Url::parse("ollama://localhost:11434").unwrap();
    assert!(matches!(
      GroqBuilder::from_url(&url),
      Err(GroqError::InvalidUrl(_))
    ));
  }
}
