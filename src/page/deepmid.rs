// 该文件是 DeepMID 项目的一部分。
// src/page/deepmid.rs - 肺部 X 光智慧诊断页面
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

use std::path::PathBuf;

use clap::ValueEnum;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
  detector::{DetectionBackend, DetectionClient, DetectionOutcome},
  page::{Page, PageError},
  prompt::{Language, Prompt},
  upload::UploadedImage,
  vision::{AnalysisResult, GenerationParams, VisionBackend},
};

pub const DEEPMID_PARAMS: GenerationParams = GenerationParams {
  temperature: 0.7,
  max_completion_tokens: 1024,
};

pub const DEFAULT_CUSTOM_PROMPT: &str =
  "請針對此肺部X光影像，使用繁體中文說明你看到了什麼？有哪些異常發現？";

const HELP_ZH_HANT: &str = "### 功能特色：
- 自動肺部病灶檢測
- 智慧醫學分析
- 治療建議提供
- 影像標示可視化

### 支援檢測的病灶：
- 0: Aortic enlargement(主動脈擴大)
- 1: Atelectasis(肺塌陷)
- 3: Cardiomegaly(心臟肥大)
- 5: ILD(間質性肺病)
- 6: Infiltration(浸潤)
- 7: Lung Opacity(肺部混濁)
- 8: NoduleMass(結節/腫塊)
- 10: Pleural effusion(胸腔積液)
- 13: Pulmonary fibrosis(肺纖維化)

### 使用流程：
1. 上傳肺部X光影像
2. 選擇分析模式
3. 點擊「開始分析」
4. 查看標示結果與診斷建議
";

const HELP_EN: &str = "### Features:
- Automatic chest lesion detection
- Intelligent medical analysis
- Treatment suggestions
- Annotated image visualisation

### Supported lesions:
- 0: Aortic enlargement
- 1: Atelectasis
- 3: Cardiomegaly
- 5: ILD (interstitial lung disease)
- 6: Infiltration
- 7: Lung Opacity
- 8: NoduleMass (nodule/mass)
- 10: Pleural effusion
- 13: Pulmonary fibrosis

### Usage:
1. Upload a chest X-ray image
2. Choose an analysis mode
3. Press \"Start analysis\"
4. Review the annotated image and the diagnostic suggestions
";

const DISCLAIMER_ZH_HANT: &str = "重要提醒：本系統提供的是AI輔助診斷建議，僅供參考使用。實際的醫學診斷必須由合格的專業醫師進行。如有健康疑慮，請立即就醫尋求專業醫療協助。";

const DISCLAIMER_EN: &str = "Important: this system provides AI-assisted diagnostic suggestions for reference only. An actual medical diagnosis must be made by a qualified physician. If you have health concerns, seek professional medical care immediately.";

/// 分析模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
  /// 智慧醫學診斷：检测病灶并生成医疗报告提示词
  #[default]
  Smart,
  /// 自訂提示詞分析
  Custom,
}

#[derive(Debug, Clone)]
pub struct DeepMidRequest {
  pub upload: UploadedImage,
  pub mode: AnalysisMode,
  /// 仅自订模式使用，缺省时使用默认提示词
  pub prompt: Option<String>,
}

impl DeepMidRequest {
  pub fn smart(upload: UploadedImage) -> Self {
    DeepMidRequest {
      upload,
      mode: AnalysisMode::Smart,
      prompt: None,
    }
  }

  pub fn custom(upload: UploadedImage, prompt: Option<String>) -> Self {
    DeepMidRequest {
      upload,
      mode: AnalysisMode::Custom,
      prompt,
    }
  }
}

#[derive(Debug, Clone)]
pub struct DeepMidReport {
  pub mode: AnalysisMode,
  pub language: Language,
  pub original: RgbImage,
  pub detection: DetectionOutcome,
  pub prompt: Prompt,
  pub analysis: AnalysisResult,
}

impl DeepMidReport {
  pub fn annotated(&self) -> Option<&RgbImage> {
    self.detection.annotated()
  }

  /// 没有标注图像时显示的警告
  pub fn annotation_warning(&self) -> Option<&'static str> {
    if self.annotated().is_some() {
      return None;
    }
    Some(match self.language {
      Language::ZhHant => "無法生成標示影像",
      Language::En => "unable to generate annotated image",
    })
  }

  pub fn lesion_notice(&self) -> String {
    self.detection.notice(self.language)
  }

  pub fn analysis_text(&self) -> String {
    self.analysis.display(self.language)
  }

  pub fn disclaimer(&self) -> &'static str {
    match self.language {
      Language::ZhHant => DISCLAIMER_ZH_HANT,
      Language::En => DISCLAIMER_EN,
    }
  }
}

/// 病灶检测 + 视觉语言模型分析
#[derive(Debug)]
pub struct DeepMid<D, V> {
  detector: DetectionClient<D>,
  vision: V,
  language: Language,
  temp_dir: Option<PathBuf>,
}

impl<D: DetectionBackend, V: VisionBackend> DeepMid<D, V> {
  pub fn new(detector: DetectionClient<D>, vision: V) -> Self {
    DeepMid {
      detector,
      vision,
      language: Language::default(),
      temp_dir: None,
    }
  }

  pub fn with_language(mut self, language: Language) -> Self {
    self.language = language;
    self
  }

  pub fn with_temp_dir(mut self, temp_dir: Option<PathBuf>) -> Self {
    self.temp_dir = temp_dir;
    self
  }
}

impl<D: DetectionBackend, V: VisionBackend> Page for DeepMid<D, V> {
  type Request = DeepMidRequest;
  type Report = DeepMidReport;

  const TITLE: &'static str = "DeepMID - 智慧醫學影像診斷系統";

  fn language(&self) -> Language {
    self.language
  }

  fn help(&self) -> &'static str {
    match self.language {
      Language::ZhHant => HELP_ZH_HANT,
      Language::En => HELP_EN,
    }
  }

  fn process(&self, request: DeepMidRequest) -> Result<DeepMidReport, PageError> {
    let DeepMidRequest {
      upload,
      mode,
      prompt,
    } = request;

    // 任何提前返回都会随 scan 一起删除临时文件
    let scan = upload.persist_temp(self.temp_dir.as_deref())?;
    let original = upload.decode()?.to_rgb8();
    info!(
      "原始影像: {}x{}, 分析模式: {:?}",
      original.width(),
      original.height(),
      mode
    );

    let detection = self.detector.detect(scan.path());
    info!("{}", detection);

    let prompt = match mode {
      AnalysisMode::Smart => {
        let labels = detection.labels().cloned().unwrap_or_default();
        Prompt::medical(&labels, self.language)
      }
      AnalysisMode::Custom => {
        Prompt::custom(prompt.unwrap_or_else(|| DEFAULT_CUSTOM_PROMPT.to_string()))
      }
    };
    debug!("提示词长度: {} 字符", prompt.as_str().chars().count());

    let analysis = match (mode, detection.annotated()) {
      (AnalysisMode::Smart, Some(annotated)) => {
        info!("使用标注影像进行分析");
        self.vision.analyze(annotated, &prompt, &DEEPMID_PARAMS)
      }
      _ => self.vision.analyze(&original, &prompt, &DEEPMID_PARAMS),
    };

    if let Err(e) = scan.close() {
      warn!("删除临时文件失败: {}", e);
    }

    Ok(DeepMidReport {
      mode,
      language: self.language,
      original,
      detection,
      prompt,
      analysis,
    })
  }
}
