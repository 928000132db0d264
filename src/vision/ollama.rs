// 该文件是 DeepMID 项目的一部分。
// src/vision/ollama.rs - Ollama 本机推理后端
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
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  codec::EncodedImage,
  http_base,
  prompt::Prompt,
  query_param,
  vision::{BackendKind, GenerationParams, VisionBackend},
};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2-vision:11b";

#[derive(Error, Debug)]
pub enum OllamaError {
  #[error("invalid backend url: {0}")]
  InvalidUrl(String),
  #[error("http error: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("service returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("malformed chat response: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
  model: &'a str,
  messages: Vec<OllamaMessage<'a>>,
  stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
  role: &'static str,
  content: &'a str,
  images: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
  message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
  content: String,
}

pub struct OllamaBuilder {
  base: String,
  model: String,
  timeout: Option<Duration>,
}

impl FromUrlWithScheme for OllamaBuilder {
  const SCHEME: &'static str = "ollama";
}

impl FromUrl for OllamaBuilder {
  type Error = OllamaError;

  /// `ollama://localhost:11434?model=llama3.2-vision:11b`，默认明文 HTTP
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !Self::scheme_matches(url.scheme()) {
      return Err(OllamaError::InvalidUrl(format!(
        "expected scheme '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let base =
      http_base(url, false).ok_or_else(|| OllamaError::InvalidUrl("missing host".to_string()))?;
    let timeout = match query_param(url, "timeout") {
      Some(value) => Some(Duration::from_secs(value.parse::<u64>().map_err(|_| {
        OllamaError::InvalidUrl(format!("invalid timeout '{value}'"))
      })?)),
      None => None,
    };

    Ok(OllamaBuilder {
      base,
      model: query_param(url, "model").unwrap_or_else(|| DEFAULT_OLLAMA_MODEL.to_string()),
      timeout,
    })
  }
}

impl OllamaBuilder {
  pub fn build(self) -> Result<OllamaClient, OllamaError> {
    let client = Client::builder().timeout(self.timeout).build()?;
    info!("本机视觉模型: {} @ {}", self.model, self.base);

    Ok(OllamaClient {
      client,
      url: format!("{}/api/chat", self.base),
      model: self.model,
    })
  }
}

#[derive(Debug)]
pub struct OllamaClient {
  client: Client,
  url: String,
  model: String,
}

impl VisionBackend for OllamaClient {
  type Error = OllamaError;

  fn kind(&self) -> BackendKind {
    BackendKind::Ollama
  }

  /// 本机后端不暴露温度与长度参数
  fn complete(
    &self,
    image: &EncodedImage,
    prompt: &Prompt,
    _params: &GenerationParams,
  ) -> Result<String, Self::Error> {
    let request = OllamaChatRequest {
      model: &self.model,
      messages: vec![OllamaMessage {
        role: "user",
        content: prompt.as_str(),
        images: vec![image.as_str()],
      }],
      stream: false,
    };
    debug!("发送 Ollama 请求: model={}", self.model);

    let response = self.client.post(&self.url).json(&request).send()?;
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
      return Err(OllamaError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let parsed: OllamaChatResponse = serde_json::from_str(&body)?;
    Ok(parsed.message.content.trim().to_string())
  }
}
