// 该文件是 DeepMID 项目的一部分。
// src/vision.rs - 视觉语言模型客户端
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

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[cfg(any(feature = "groq", feature = "ollama"))]
use crate::{FromUrl, FromUrlWithScheme};
use crate::{
  codec::{EncodedImage, JpegEncode, encode_base64},
  config::Credentials,
  prompt::{Language, Prompt},
};

#[cfg(feature = "groq")]
mod groq;
#[cfg(feature = "groq")]
pub use self::groq::{GroqBuilder, GroqClient, GroqError};

#[cfg(feature = "ollama")]
mod ollama;
#[cfg(feature = "ollama")]
pub use self::ollama::{OllamaBuilder, OllamaClient, OllamaError};

/// 后端种类，用于错误标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
  Groq,
  Ollama,
}

impl BackendKind {
  pub fn tag(&self) -> &'static str {
    match self {
      BackendKind::Groq => "Groq API",
      BackendKind::Ollama => "Ollama API",
    }
  }
}

/// 生成参数，不支持的后端会忽略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
  pub temperature: f32,
  pub max_completion_tokens: u32,
}

/// 分析结果：成功文本或带后端标签的失败
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AnalysisResult {
  Success { text: String },
  Failure { backend: BackendKind, message: String },
}

impl AnalysisResult {
  pub fn is_success(&self) -> bool {
    matches!(self, AnalysisResult::Success { .. })
  }

  pub fn text(&self) -> Option<&str> {
    match self {
      AnalysisResult::Success { text } => Some(text),
      AnalysisResult::Failure { .. } => None,
    }
  }

  pub fn display(&self, language: Language) -> String {
    match (self, language) {
      (AnalysisResult::Success { text }, _) => text.clone(),
      (AnalysisResult::Failure { backend, message }, Language::En) => {
        format!("{} error: {}", backend.tag(), message)
      }
      (AnalysisResult::Failure { backend, message }, Language::ZhHant) => {
        format!("{} 錯誤: {}", backend.tag(), message)
      }
    }
  }
}

impl std::fmt::Display for AnalysisResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.display(Language::En))
  }
}

/// 视觉语言模型后端能力接口
pub trait VisionBackend {
  type Error: std::fmt::Display;

  fn kind(&self) -> BackendKind;

  fn complete(
    &self,
    image: &EncodedImage,
    prompt: &Prompt,
    params: &GenerationParams,
  ) -> Result<String, Self::Error>;

  /// 编码图像并调用后端，失败时返回带标签的 [`AnalysisResult::Failure`]
  fn analyze<I: JpegEncode + ?Sized>(
    &self,
    image: &I,
    prompt: &Prompt,
    params: &GenerationParams,
  ) -> AnalysisResult {
    let backend = self.kind();
    let encoded = match encode_base64(image) {
      Ok(encoded) => encoded,
      Err(e) => {
        error!("图像编码失败: {}", e);
        return AnalysisResult::Failure {
          backend,
          message: format!("image encoding failed: {e}"),
        };
      }
    };

    info!("调用 {} 分析图像...", backend.tag());
    let now = std::time::Instant::now();
    match self.complete(&encoded, prompt, params) {
      Ok(text) => {
        info!("{} 分析完成，耗时: {:.2?}", backend.tag(), now.elapsed());
        AnalysisResult::Success { text }
      }
      Err(e) => {
        error!("{} 调用失败: {}", backend.tag(), e);
        AnalysisResult::Failure {
          backend,
          message: e.to_string(),
        }
      }
    }
  }
}

#[derive(Error, Debug)]
pub enum VisionError {
  #[cfg(feature = "groq")]
  #[error(transparent)]
  GroqError(#[from] GroqError),
  #[cfg(feature = "ollama")]
  #[error(transparent)]
  OllamaError(#[from] OllamaError),
  #[error("unsupported vision backend scheme: {0}")]
  SchemeMismatch(String),
}

/// 由配置 URL 选择的视觉语言后端
#[derive(Debug)]
pub enum VisionWrapper {
  #[cfg(feature = "groq")]
  Groq(GroqClient),
  #[cfg(feature = "ollama")]
  Ollama(OllamaClient),
}

impl VisionWrapper {
  pub fn connect(url: &Url, credentials: &Credentials) -> Result<Self, VisionError> {
    #[cfg(feature = "groq")]
    if GroqBuilder::scheme_matches(url.scheme()) {
      let client = GroqBuilder::from_url(url)?
        .api_key(credentials.groq_api_key.clone())
        .build()?;
      return Ok(VisionWrapper::Groq(client));
    }
    #[cfg(feature = "ollama")]
    if OllamaBuilder::scheme_matches(url.scheme()) {
      let client = OllamaBuilder::from_url(url)?.build()?;
      return Ok(VisionWrapper::Ollama(client));
    }
    let _ = credentials;
    Err(VisionError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl VisionBackend for VisionWrapper {
  type Error = VisionError;

  fn kind(&self) -> BackendKind {
    match *self {
      #[cfg(feature = "groq")]
      VisionWrapper::Groq(ref client) => client.kind(),
      #[cfg(feature = "ollama")]
      VisionWrapper::Ollama(ref client) => client.kind(),
    }
  }

  fn complete(
    &self,
    image: &EncodedImage,
    prompt: &Prompt,
    params: &GenerationParams,
  ) -> Result<String, Self::Error> {
    match *self {
      #[cfg(feature = "groq")]
      VisionWrapper::Groq(ref client) => client
        .complete(image, prompt, params)
        .map_err(VisionError::from),
      #[cfg(feature = "ollama")]
      VisionWrapper::Ollama(ref client) => client
        .complete(image, prompt, params)
        .map_err(VisionError::from),
    }
  }
}

impl<B: VisionBackend + ?Sized> VisionBackend for &B {
  type Error = B::Error;

  fn kind(&self) -> BackendKind {
    (**self).kind()
  }

  fn complete(
    &self,
    image: &EncodedImage,
    prompt: &Prompt,
    params: &GenerationParams,
  ) -> Result<String, Self::Error> {
    (**self).complete(image, prompt, params)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;

  struct Echo;

  impl VisionBackend for Echo {
    type Error = String;

    fn kind(&self) -> BackendKind {
      BackendKind::Ollama
    }

    fn complete(
      &self,
      image: &EncodedImage,
      prompt: &Prompt,
      params: &GenerationParams,
    ) -> Result<String, Self::Error> {
      if prompt.as_str() == "fail" {
        return Err("connection refused".to_string());
      }
      Ok(format!(
        "{}|{}|{}",
        prompt,
        params.max_completion_tokens,
        !image.as_str().is_empty()
      ))
    }
  }

  const PARAMS: GenerationParams = GenerationParams {
    temperature: 1.0,
    max_completion_tokens: 512,
  };

  #[test]
  fn test_analyze_success_passes_through() {
    let image = RgbImage::new(8, 8);
    let result = Echo.analyze(&image, &Prompt::custom("hi"), &PARAMS);
    assert_eq!(
      result,
      AnalysisResult::Success {
        text: "hi|512|true".to_string()
      }
    );
  }

  #[test]
  fn test_analyze_failure_is_tagged() {
    let image = RgbImage::new(8, 8);
    let result = Echo.analyze(&image, &Prompt::custom("fail"), &PARAMS);
    assert!(!result.is_success());
    assert_eq!(result.to_string(), "Ollama API error: connection refused");
    assert_eq!(
      result.display(Language::ZhHant),
      "Ollama API 錯誤: connection refused"
    );
  }

  #[test]
  fn test_encoding_failure_is_tagged() {
    let image = RgbImage::new(0, 0);
    let result = Echo.analyze(&image, &Prompt::custom("hi"), &PARAMS);
    match result {
      AnalysisResult::Failure { backend, message } => {
        assert_eq!(backend, BackendKind::Ollama);
        assert!(message.starts_with("image encoding failed"));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn test_unknown_scheme_rejected() {
    let url = Url::parse("openai://api.openai.com/v1").unwrap();
    assert!(matches!(
      VisionWrapper::connect(&url, &Credentials::default()),
      Err(VisionError::SchemeMismatch(_))
    ));
  }
}
