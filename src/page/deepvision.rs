// 该文件是 DeepMID 项目的一部分。
// src/page/deepvision.rs - 通用影像分析页面
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

use clap::ValueEnum;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
  page::{Page, PageError},
  prompt::{Language, Prompt},
  upload::UploadedImage,
  vision::{AnalysisResult, GenerationParams, VisionBackend},
};

pub const DEEPVISION_PARAMS: GenerationParams = GenerationParams {
  temperature: 1.0,
  max_completion_tokens: 512,
};

pub const DEFAULT_PROMPT: &str = "請針對此圖片，使用繁體中文說明你看到了什麼？請說明你看到的特點。";

const HELP_ZH_HANT: &str = "### API種類：
- Groq(雲端)
- Ollama(本機)：使用llama3.2-vision:11b模型，本機硬體效能足夠時再選擇，否則分析會非常久

### 使用流程：
1. 選擇API
2. 上傳影像
3. 輸入提示詞
4. 點擊「分析影像」
5. 查看結果
";

const HELP_EN: &str = "### Backends:
- Groq (cloud)
- Ollama (local): runs the llama3.2-vision:11b model; only pick it on capable hardware, otherwise analysis is very slow

### Usage:
1. Choose a backend
2. Upload an image
3. Enter a prompt
4. Press \"Analyse image\"
5. Review the result
";

/// 调用时选择的视觉后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendChoice {
  /// Groq(雲端)
  #[default]
  Cloud,
  /// Ollama(本機)
  Local,
}

#[derive(Debug, Clone)]
pub struct DeepVisionRequest {
  pub upload: UploadedImage,
  pub backend: BackendChoice,
  pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeepVisionReport {
  pub backend: BackendChoice,
  pub language: Language,
  pub original: RgbImage,
  pub prompt: Prompt,
  pub analysis: AnalysisResult,
}

impl DeepVisionReport {
  pub fn analysis_text(&self) -> String {
    self.analysis.display(self.language)
  }
}

/// 纯视觉语言模型分析，不做检测
#[derive(Debug)]
pub struct DeepVision<V> {
  cloud: V,
  local: V,
  language: Language,
}

impl<V: VisionBackend> DeepVision<V> {
  pub fn new(cloud: V, local: V) -> Self {
    DeepVision {
      cloud,
      local,
      language: Language::default(),
    }
  }

  pub fn with_language(mut self, language: Language) -> Self {
    self.language = language;
    self
  }

  pub fn backend(&self, choice: BackendChoice) -> &V {
    match choice {
      BackendChoice::Cloud => &self.cloud,
      BackendChoice::Local => &self.local,
    }
  }
}

impl<V: VisionBackend> Page for DeepVision<V> {
  type Request = DeepVisionRequest;
  type Report = DeepVisionReport;

  const TITLE: &'static str = "DeepVision - AI影像分析助手";

  fn language(&self) -> Language {
    self.language
  }

  fn help(&self) -> &'static str {
    match self.language {
      Language::ZhHant => HELP_ZH_HANT,
      Language::En => HELP_EN,
    }
  }

  fn process(&self, request: DeepVisionRequest) -> Result<DeepVisionReport, PageError> {
    let original = request.upload.decode()?.to_rgb8();
    let prompt = Prompt::custom(request.prompt.unwrap_or_else(|| DEFAULT_PROMPT.to_string()));

    let backend = self.backend(request.backend);
    info!(
      "使用 {} 分析影像 {}x{}",
      backend.kind().tag(),
      original.width(),
      original.height()
    );
    let analysis = backend.analyze(&original, &prompt, &DEEPVISION_PARAMS);

    Ok(DeepVisionReport {
      backend: request.backend,
      language: self.language,
      original,
      prompt,
      analysis,
    })
  }
}
