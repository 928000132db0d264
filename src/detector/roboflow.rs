// 该文件是 DeepMID 项目的一部分。
// src/detector/roboflow.rs - Roboflow 托管检测模型
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

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  codec::encode_bytes,
  detector::{DetectionBackend, Prediction, Predictions},
  http_origin, query_param,
};

const DEFAULT_CONFIDENCE: u8 = 40;
const DEFAULT_OVERLAP: u8 = 30;

#[derive(Error, Debug)]
pub enum RoboflowError {
  #[error("invalid detector url: {0}")]
  InvalidUrl(String),
  #[error("failed to read image: {0}")]
  IoError(#[from] std::io::Error),
  #[error("http error: {0}")]
  HttpError(#[from] reqwest::Error),
  #[error("detection service returned {status}: {body}")]
  Status { status: u16, body: String },
  #[error("malformed detection response: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RoboflowResponse {
  predictions: Vec<Prediction>,
}

pub struct RoboflowBuilder {
  endpoint: String,
  project: String,
  version: u32,
  confidence: u8,
  overlap: u8,
  api_key: Option<String>,
  timeout: Option<Duration>,
}

impl FromUrlWithScheme for RoboflowBuilder {
  const SCHEME: &'static str = "roboflow";
}

impl FromUrl for RoboflowBuilder {
  type Error = RoboflowError;

  /// `roboflow://detect.roboflow.com/<project>/<version>?confidence=40&overlap=30`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !Self::scheme_matches(url.scheme()) {
      return Err(RoboflowError::InvalidUrl(format!(
        "expected scheme '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let endpoint = http_origin(url, true)
      .ok_or_else(|| RoboflowError::InvalidUrl("missing host".to_string()))?;

    let segments: Vec<&str> = url
      .path_segments()
      .map(|segments| segments.filter(|s| !s.is_empty()).collect())
      .unwrap_or_default();
    let (project, version) = match segments.as_slice() {
      [project, version] => (project.to_string(), *version),
      _ => {
        return Err(RoboflowError::InvalidUrl(format!(
          "expected /<project>/<version>, found '{}'",
          url.path()
        )));
      }
    };
    let version = version
      .parse::<u32>()
      .map_err(|_| RoboflowError::InvalidUrl(format!("invalid model version '{version}'")))?;

    let percent = |key: &str, default: u8| -> Result<u8, RoboflowError> {
      match query_param(url, key) {
        Some(value) => value
          .parse::<u8>()
          .ok()
          .filter(|v| *v <= 100)
          .ok_or_else(|| RoboflowError::InvalidUrl(format!("invalid {key} '{value}'"))),
        None => Ok(default),
      }
    };

    let timeout = match query_param(url, "timeout") {
      Some(value) => Some(Duration::from_secs(value.parse::<u64>().map_err(|_| {
        RoboflowError::InvalidUrl(format!("invalid timeout '{value}'"))
      })?)),
      None => None,
    };

    Ok(RoboflowBuilder {
      endpoint,
      project,
      version,
      confidence: percent("confidence", DEFAULT_CONFIDENCE)?,
      overlap: percent("overlap", DEFAULT_OVERLAP)?,
      api_key: query_param(url, "api_key"),
      timeout,
    })
  }
}

impl RoboflowBuilder {
  /// 启动配置中的凭证优先于 URL 中的 `api_key`
  pub fn api_key(mut self, api_key: Option<String>) -> Self {
    if api_key.is_some() {
      self.api_key = api_key;
    }
    self
  }

  pub fn build(self) -> Result<RoboflowDetector, RoboflowError> {
    if self.api_key.is_none() {
      warn!("未配置 Roboflow API 金钥，检测请求将被拒绝");
    }

    let client = Client::builder().timeout(self.timeout).build()?;
    info!(
      "检测模型: {}/{}/{} (confidence={}, overlap={})",
      self.endpoint, self.project, self.version, self.confidence, self.overlap
    );

    Ok(RoboflowDetector {
      client,
      url: format!("{}/{}/{}", self.endpoint, self.project, self.version),
      confidence: self.confidence,
      overlap: self.overlap,
      api_key: self.api_key,
    })
  }
}

pub struct RoboflowDetector {
  client: Client,
  url: String,
  confidence: u8,
  overlap: u8,
  api_key: Option<String>,
}

impl std::fmt::Debug for RoboflowDetector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RoboflowDetector")
      .field("url", &self.url)
      .field("confidence", &self.confidence)
      .field("overlap", &self.overlap)
      .finish_non_exhaustive()
  }
}

impl DetectionBackend for RoboflowDetector {
  type Error = RoboflowError;

  fn predict(&self, image_path: &Path) -> Result<Predictions, Self::Error> {
    let bytes = std::fs::read(image_path)?;
    debug!("上传检测图像，大小: {} 字节", bytes.len());

    let mut query = vec![
      ("confidence", self.confidence.to_string()),
      ("overlap", self.overlap.to_string()),
      ("format", "json".to_string()),
    ];
    if let Some(api_key) = &self.api_key {
      query.push(("api_key", api_key.clone()));
    }

    // 请求地址带有 api_key，错误信息中不保留 URL
    let response = self
      .client
      .post(&self.url)
      .query(&query)
      .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
      .body(encode_bytes(&bytes))
      .send()
      .map_err(reqwest::Error::without_url)?;

    let status = response.status();
    let body = response.text().map_err(reqwest::Error::without_url)?;
    if !status.is_success() {
      return Err(RoboflowError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let parsed: RoboflowResponse = serde_json::from_str(&body)?;
    debug!("检测结果: {:?}", parsed.predictions);
    Ok(Predictions::from(parsed.predictions))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builder_from_url_defaults() {
    let url = Url::parse("roboflow://detect.roboflow.com/chest-xray-yolo/6").unwrap();
    let builder = RoboflowBuilder::from_url(&url).unwrap();
    assert_eq!(builder.endpoint, "https://detect.roboflow.com");
    assert_eq!(builder.project, "chest-xray-yolo");
    assert_eq!(builder.version, 6);
    assert_eq!(builder.confidence, 40);
    assert_eq!(builder.overlap, 30);
    assert!(builder.api_key.is_none());
  }

  #[test]
  fn test_builder_reads_thresholds_and_plain_http() {
    let url =
      Url::parse("roboflow+http://127.0.0.1:8080/lungs/2?confidence=55&overlap=10&api_key=k")
        .unwrap();
    let builder = RoboflowBuilder::from_url(&url).unwrap();
    assert_eq!(builder.endpoint, "http://127.0.0.1:8080");
    assert_eq!(builder.confidence, 55);
    assert_eq!(builder.overlap, 10);
    assert_eq!(builder.api_key.as_deref(), Some("k"));
  }

  #[test]
  fn test_configured_key_overrides_url_key() {
    let url = Url::parse("roboflow://detect.roboflow.com/p/1?api_key=from-url").unwrap();
    let builder = RoboflowBuilder::from_url(&url)
      .unwrap()
      .api_key(Some("from-config".to_string()));
    assert_eq!(builder.api_key.as_deref(), Some("from-config"));
    let builder = RoboflowBuilder::from_url(&url).unwrap().api_key(None);
    assert_eq!(builder.api_key.as_deref(), Some("from-url"));
  }

  #[test]
  fn test_builder_rejects_bad_urls() {
    for raw in [
      "groq://detect.roboflow.com/p/1",
      "roboflow://detect.roboflow.com/p",
      "roboflow://detect.roboflow.com/p/six",
      "roboflow://detect.roboflow.com/p/1?confidence=140",
    ] {
      let url = Url::parse(raw).unwrap();
      assert!(
        matches!(RoboflowBuilder::from_url(&url), Err(RoboflowError::InvalidUrl(_))),
        "{raw} should be rejected"
      );
    }
  }

  #[test]
  fn test_transport_error_hides_api_key() {
    let url = Url::parse("roboflow+http://127.0.0.1:1/chest-xray-yolo/6").unwrap();
    let detector = RoboflowBuilder::from_url(&url)
      .unwrap()
      .api_key(Some("SECRET-RF-KEY".to_string()))
      .build()
      .unwrap();

    let mut image = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut image, b"not really a jpeg").unwrap();

    let error = detector.predict(image.path()).unwrap_err();
    assert!(matches!(error, RoboflowError::HttpError(_)), "{error:?}");
    let message = error.to_string();
    assert!(!message.contains("SECRET-RF-KEY"), "{message}");
    assert!(!message.contains("api_key"), "{message}");
    assert!(!format!("{error:?}").contains("SECRET-RF-KEY"));
  }
}
