// 该文件是 DeepMID 项目的一部分。
// src/config.rs - 启动配置与凭证
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

use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  annotate::{AnnotateError, Annotator},
  detector::{DetectionClient, DetectorError, DetectorWrapper},
  page::{DeepMid, DeepVision},
  prompt::Language,
  vision::{VisionError, VisionWrapper},
};

pub const DEFAULT_DETECTOR_URL: &str =
  "roboflow://detect.roboflow.com/chest-xray-yolo/6?confidence=40&overlap=30";
pub const DEFAULT_CLOUD_URL: &str =
  "groq://api.groq.com/openai/v1?model=meta-llama/llama-4-scout-17b-16e-instruct";
pub const DEFAULT_LOCAL_URL: &str = "ollama://localhost:11434?model=llama3.2-vision:11b";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("检测后端配置错误: {0}")]
  DetectorError(#[from] DetectorError),
  #[error("视觉模型后端配置错误: {0}")]
  VisionError(#[from] VisionError),
  #[error("字体配置错误: {0}")]
  FontError(#[from] AnnotateError),
}

/// 进程级凭证，启动时解析后注入各后端
#[derive(Clone, Default)]
pub struct Credentials {
  pub roboflow_api_key: Option<String>,
  pub groq_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let redact = |key: &Option<String>| key.as_ref().map(|_| "***");
    f.debug_struct("Credentials")
      .field("roboflow_api_key", &redact(&self.roboflow_api_key))
      .field("groq_api_key", &redact(&self.groq_api_key))
      .finish()
  }
}

pub const DEFAULT_BIND: &str = "127.0.0.1:8501";

/// DeepMID 页面服务配置
#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
  /// 服务监听地址
  #[arg(long, env = "DEEPMID_BIND", value_name = "ADDR", default_value = DEFAULT_BIND)]
  pub bind: SocketAddr,

  /// 会话在最后一次更新后保留的秒数
  #[arg(long, env = "DEEPMID_SESSION_TTL", value_name = "SECS", default_value_t = 3600)]
  pub session_ttl: u64,

  /// 每个页面最多保留的会话数
  #[arg(long, env = "DEEPMID_MAX_SESSIONS", value_name = "N", default_value_t = 256)]
  pub max_sessions: usize,

  #[command(flatten)]
  pub backends: BackendSettings,
}

/// 两个页面共用的后端配置
#[derive(Args, Clone)]
pub struct BackendSettings {
  /// 检测后端 URL（roboflow://<主机>/<项目>/<版本>?confidence=40&overlap=30）
  #[arg(long, value_name = "URL", default_value = DEFAULT_DETECTOR_URL)]
  pub detector: Url,

  /// 云端视觉模型 URL（groq://<主机>/<路径>?model=<模型>）
  #[arg(long, value_name = "URL", default_value = DEFAULT_CLOUD_URL)]
  pub cloud: Url,

  /// 本机视觉模型 URL（ollama://<主机>:<端口>?model=<模型>）
  #[arg(long, value_name = "URL", default_value = DEFAULT_LOCAL_URL)]
  pub local: Url,

  /// Roboflow API 金钥
  #[arg(long, env = "ROBOFLOW_API_KEY", hide_env_values = true)]
  pub roboflow_api_key: Option<String>,

  /// Groq API 金钥
  #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
  pub groq_api_key: Option<String>,

  /// 报告语言
  #[arg(long, value_enum, default_value_t = Language::ZhHant)]
  pub language: Language,

  /// 标注字体文件（默认使用内置 DejaVu Sans）
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 上传临时文件目录（默认为系统临时目录）
  #[arg(long, value_name = "DIR")]
  pub temp_dir: Option<PathBuf>,
}

impl BackendSettings {
  pub fn credentials(&self) -> Credentials {
    Credentials {
      roboflow_api_key: self.roboflow_api_key.clone(),
      groq_api_key: self.groq_api_key.clone(),
    }
  }

  pub fn annotator(&self) -> Result<Annotator, AnnotateError> {
    match &self.font {
      Some(path) => {
        info!("加载标注字体: {}", path.display());
        Annotator::from_font_file(path)
      }
      None => Ok(Annotator::default()),
    }
  }

  pub fn deepmid_page(&self) -> Result<DeepMid<DetectorWrapper, VisionWrapper>, ConfigError> {
    let credentials = self.credentials();
    let detector = DetectorWrapper::connect(&self.detector, &credentials)?;
    let vision = VisionWrapper::connect(&self.cloud, &credentials)?;
    let client = DetectionClient::with_annotator(detector, self.annotator()?);

    Ok(
      DeepMid::new(client, vision)
        .with_language(self.language)
        .with_temp_dir(self.temp_dir.clone()),
    )
  }

  pub fn deepvision_page(&self) -> Result<DeepVision<VisionWrapper>, ConfigError> {
    let credentials = self.credentials();
    let cloud = VisionWrapper::connect(&self.cloud, &credentials)?;
    let local = VisionWrapper::connect(&self.local, &credentials)?;

    Ok(DeepVision::new(cloud, local).with_language(self.language))
  }
}
