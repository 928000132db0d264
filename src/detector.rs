// 该文件是 DeepMID 项目的一部分。
// src/detector.rs - 病灶检测客户端
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

use std::collections::BTreeSet;
use std::path::Path;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::FromUrl;
#[cfg(feature = "roboflow")]
use crate::FromUrlWithScheme;
use crate::annotate::Annotator;
use crate::config::Credentials;
use crate::prompt::Language;

#[cfg(feature = "roboflow")]
mod roboflow;
#[cfg(feature = "roboflow")]
pub use self::roboflow::{RoboflowBuilder, RoboflowDetector, RoboflowError};

/// 检测后端返回的单个检测框，坐标为像素，(x, y) 为框中心
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
  pub class: String,
  #[serde(default)]
  pub class_id: Option<u32>,
  pub confidence: f32,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl Prediction {
  /// [x_min, y_min, x_max, y_max]
  pub fn corners(&self) -> [f32; 4] {
    let half_w = self.width / 2.0;
    let half_h = self.height / 2.0;
    [
      self.x - half_w,
      self.y - half_h,
      self.x + half_w,
      self.y + half_h,
    ]
  }
}

#[derive(Debug, Clone, Default)]
pub struct Predictions {
  pub items: Box<[Prediction]>,
}

impl Predictions {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  /// 按顺序列出所有类别标签（允许重复）
  pub fn labels(&self) -> impl Iterator<Item = &str> {
    self.items.iter().map(|item| item.class.as_str())
  }

  pub fn unique_labels(&self) -> LesionSet {
    self.labels().collect()
  }
}

impl From<Vec<Prediction>> for Predictions {
  fn from(items: Vec<Prediction>) -> Self {
    Predictions {
      items: items.into_boxed_slice(),
    }
  }
}

/// 去重后的病灶类别集合，丢弃位置与置信度
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LesionSet(BTreeSet<String>);

impl LesionSet {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn contains(&self, label: &str) -> bool {
    self.0.contains(label)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  pub fn join(&self, separator: &str) -> String {
    self.iter().collect::<Vec<_>>().join(separator)
  }
}

impl<S: Into<String>> FromIterator<S> for LesionSet {
  fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
    LesionSet(iter.into_iter().map(Into::into).collect())
  }
}

/// 一次检测调用的结果
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
  Lesions {
    annotated: RgbImage,
    labels: LesionSet,
  },
  NoLesion,
  Failed(String),
}

impl DetectionOutcome {
  pub fn annotated(&self) -> Option<&RgbImage> {
    match self {
      DetectionOutcome::Lesions { annotated, .. } => Some(annotated),
      _ => None,
    }
  }

  pub fn labels(&self) -> Option<&LesionSet> {
    match self {
      DetectionOutcome::Lesions { labels, .. } => Some(labels),
      _ => None,
    }
  }

  pub fn notice(&self, language: Language) -> String {
    match (self, language) {
      (DetectionOutcome::Lesions { labels, .. }, Language::En) => {
        format!("Detected lesions: {}", labels.join(", "))
      }
      (DetectionOutcome::Lesions { labels, .. }, Language::ZhHant) => {
        format!("檢測到的病灶： {}", labels.join(", "))
      }
      (DetectionOutcome::NoLesion, Language::En) => "no lesion detected".to_string(),
      (DetectionOutcome::NoLesion, Language::ZhHant) => "未檢測到明顯病灶".to_string(),
      (DetectionOutcome::Failed(message), Language::En) => format!("detection error: {message}"),
      (DetectionOutcome::Failed(message), Language::ZhHant) => {
        format!("YOLO 檢測錯誤: {message}")
      }
    }
  }
}

impl std::fmt::Display for DetectionOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.notice(Language::En))
  }
}

pub trait DetectionBackend {
  type Error: std::fmt::Display;

  fn predict(&self, image_path: &Path) -> Result<Predictions, Self::Error>;
}

impl<B: DetectionBackend + ?Sized> DetectionBackend for &B {
  type Error = B::Error;

  fn predict(&self, image_path: &Path) -> Result<Predictions, Self::Error> {
    (**self).predict(image_path)
  }
}

/// 检测后端 + 标注，所有错误都转换为 [`DetectionOutcome::Failed`]
#[derive(Debug)]
pub struct DetectionClient<B> {
  backend: B,
  annotator: Annotator,
}

impl<B: DetectionBackend> DetectionClient<B> {
  pub fn new(backend: B) -> Self {
    Self::with_annotator(backend, Annotator::default())
  }

  pub fn with_annotator(backend: B, annotator: Annotator) -> Self {
    DetectionClient { backend, annotator }
  }

  pub fn detect(&self, image_path: &Path) -> DetectionOutcome {
    info!("开始病灶检测: {}", image_path.display());
    let now = std::time::Instant::now();

    let predictions = match self.backend.predict(image_path) {
      Ok(predictions) => predictions,
      Err(e) => {
        error!("检测后端调用失败: {}", e);
        return DetectionOutcome::Failed(e.to_string());
      }
    };
    info!(
      "检测完成，耗时: {:.2?}，检测到 {} 个目标",
      now.elapsed(),
      predictions.len()
    );

    if predictions.is_empty() {
      return DetectionOutcome::NoLesion;
    }

    let labels = predictions.unique_labels();
    match self.annotator.annotate_file(image_path, &predictions.items) {
      Ok(annotated) => DetectionOutcome::Lesions { annotated, labels },
      Err(e) => {
        warn!("标注检测结果失败: {}", e);
        DetectionOutcome::Failed(e.to_string())
      }
    }
  }
}

#[derive(Error, Debug)]
pub enum DetectorError {
  #[cfg(feature = "roboflow")]
  #[error(transparent)]
  RoboflowError(#[from] RoboflowError),
  #[error("unsupported detector scheme: {0}")]
  SchemeMismatch(String),
}

#[derive(Debug)]
pub enum DetectorWrapper {
  #[cfg(feature = "roboflow")]
  Roboflow(RoboflowDetector),
}

impl DetectorWrapper {
  /// 根据 URL 方案构造检测后端，凭证来自启动配置
  pub fn connect(url: &Url, credentials: &Credentials) -> Result<Self, DetectorError> {
    #[cfg(feature = "roboflow")]
    if RoboflowBuilder::scheme_matches(url.scheme()) {
      let detector = RoboflowBuilder::from_url(url)?
        .api_key(credentials.roboflow_api_key.clone())
        .build()?;
      return Ok(DetectorWrapper::Roboflow(detector));
    }
    let _ = credentials;
    Err(DetectorError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl DetectionBackend for DetectorWrapper {
  type Error = DetectorError;

  fn predict(&self, image_path: &Path) -> Result<Predictions, Self::Error> {
    match *self {
      #[cfg(feature = "roboflow")]
      DetectorWrapper::Roboflow(ref detector) => detector
        .predict(image_path)
        .map_err(DetectorError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::encode_png;
  use image::DynamicImage;

  struct FixedBackend(Result<Vec<Prediction>, String>);

  impl DetectionBackend for FixedBackend {
    type Error = String;

    fn predict(&self, _image_path: &Path) -> Result<Predictions, Self::Error> {
      self.0.clone().map(Predictions::from)
    }
  }

  fn prediction(class: &str) -> Prediction {
    Prediction {
      class: class.to_string(),
      class_id: None,
      confidence: 0.8,
      x: 20.0,
      y: 20.0,
      width: 10.0,
      height: 10.0,
    }
  }

  fn scan_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    let png = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(64, 48))).unwrap();
    std::io::Write::write_all(&mut file, &png).unwrap();
    file
  }

  #[test]
  fn test_empty_predictions_give_no_lesion_without_annotating() {
    // 路径不存在：如果尝试标注会得到 Failed
    let client = DetectionClient::new(FixedBackend(Ok(vec![])));
    let outcome = client.detect(Path::new("/nonexistent/scan.jpg"));
    assert!(matches!(outcome, DetectionOutcome::NoLesion));
    assert_eq!(outcome.to_string(), "no lesion detected");
    assert!(outcome.annotated().is_none());
  }

  #[test]
  fn test_backend_error_is_captured() {
    let client = DetectionClient::new(FixedBackend(Err("connection reset".to_string())));
    let outcome = client.detect(Path::new("/nonexistent/scan.jpg"));
    let text = outcome.to_string();
    assert!(text.starts_with("detection error"), "got: {text}");
    assert!(text.contains("connection reset"));
    assert!(outcome.annotated().is_none());
  }

  #[test]
  fn test_labels_are_deduplicated() {
    let file = scan_file();
    let client = DetectionClient::new(FixedBackend(Ok(vec![
      prediction("Cardiomegaly"),
      prediction("ILD"),
      prediction("Cardiomegaly"),
    ])));
    let outcome = client.detect(file.path());
    let labels = outcome.labels().expect("lesions expected");
    assert_eq!(labels.len(), 2);
    assert!(labels.contains("Cardiomegaly"));
    assert!(labels.contains("ILD"));
    assert_eq!(outcome.annotated().unwrap().dimensions(), (64, 48));
  }

  #[test]
  fn test_annotation_failure_becomes_detection_error() {
    let client = DetectionClient::new(FixedBackend(Ok(vec![prediction("Infiltration")])));
    let outcome = client.detect(Path::new("/nonexistent/scan.jpg"));
    assert!(matches!(outcome, DetectionOutcome::Failed(_)));
  }

  #[test]
  fn test_localized_notice() {
    assert_eq!(
      DetectionOutcome::NoLesion.notice(Language::ZhHant),
      "未檢測到明顯病灶"
    );
    let failed = DetectionOutcome::Failed("boom".to_string());
    assert_eq!(failed.notice(Language::ZhHant), "YOLO 檢測錯誤: boom");
  }

  #[test]
  fn test_prediction_corners() {
    let p = Prediction {
      class: "NoduleMass".to_string(),
      class_id: Some(8),
      confidence: 0.5,
      x: 50.0,
      y: 40.0,
      width: 20.0,
      height: 10.0,
    };
    assert_eq!(p.corners(), [40.0, 35.0, 60.0, 45.0]);
  }

  #[cfg(feature = "roboflow")]
  #[test]
  fn test_refused_detector_notice_keeps_key_private() {
    let url = Url::parse("roboflow+http://127.0.0.1:1/chest-xray-yolo/6").unwrap();
    let credentials = Credentials {
      roboflow_api_key: Some("TOPSECRET-KEY".to_string()),
      groq_api_key: None,
    };
    let client = DetectionClient::new(DetectorWrapper::connect(&url, &credentials).unwrap());
    let file = scan_file();

    let outcome = client.detect(file.path());
    assert!(matches!(outcome, DetectionOutcome::Failed(_)));
    for language in [Language::En, Language::ZhHant] {
      let notice = outcome.notice(language);
      assert!(!notice.contains("TOPSECRET-KEY"), "got: {notice}");
      assert!(!notice.contains("api_key"), "got: {notice}");
    }
    assert!(outcome.to_string().starts_with("detection error"));
  }

  #[test]
  fn test_unknown_scheme_rejected() {
    let url = Url::parse("yolo://localhost/model").unwrap();
    let result = DetectorWrapper::connect(&url, &Credentials::default());
    assert!(matches!(result, Err(DetectorError::SchemeMismatch(s)) if s == "yolo"));
  }
}
