// 该文件是 DeepMID 项目的一部分。
// src/prompt.rs - 提示词构建
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
use serde::Serialize;

use crate::detector::LesionSet;

/// 报告与界面文字所用语言
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
  /// 繁体中文
  #[default]
  #[value(name = "zh-hant")]
  ZhHant,
  /// English
  #[value(name = "en")]
  En,
}

impl Language {
  /// 病灶集合为空时的占位文字
  pub fn no_lesion_placeholder(&self) -> &'static str {
    match self {
      Language::ZhHant => "未發現明顯病灶",
      Language::En => "no obvious lesion found",
    }
  }

  pub fn label_separator(&self) -> &'static str {
    match self {
      Language::ZhHant => "、",
      Language::En => ", ",
    }
  }

  /// 医疗报告模板的五个固定段落标题
  pub fn section_headers(&self) -> [&'static str; 5] {
    match self {
      Language::ZhHant => ["影像發現", "可能診斷", "嚴重程度", "建議處置", "就醫建議"],
      Language::En => [
        "Image findings",
        "Possible diagnosis",
        "Severity",
        "Recommended actions",
        "Referral guidance",
      ],
    }
  }

  /// 模板末尾要求模型附上的免责声明
  pub fn prompt_disclaimer(&self) -> &'static str {
    match self {
      Language::ZhHant => "請以專業、清晰的方式呈現，並註明這只是AI輔助診斷，最終診斷需由專業醫師確認。",
      Language::En => "Present the analysis professionally and clearly, and state that this is an AI-assisted diagnosis only and that the final diagnosis must be confirmed by a qualified physician.",
    }
  }
}

/// 不可变的提示词
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt(String);

impl Prompt {
  /// 按检测到的病灶渲染医疗报告模板
  pub fn medical(labels: &LesionSet, language: Language) -> Prompt {
    let lesions = if labels.is_empty() {
      language.no_lesion_placeholder().to_string()
    } else {
      labels.join(language.label_separator())
    };

    let [findings, diagnosis, severity, actions, referral] = language.section_headers();
    let disclaimer = language.prompt_disclaimer();

    let text = match language {
      Language::ZhHant => format!(
        "你是一位專業的放射科醫師，請分析這張肺部X光影像。

檢測到的病灶類型: {lesions}

請用繁體中文提供專業的醫學分析，包含以下內容:

1. {findings}: 詳細描述在X光片中觀察到的異常發現
2. {diagnosis}: 根據病灶特徵提出可能的醫學診斷
3. {severity}: 評估病情的嚴重程度(輕度/中度/重度)
4. {actions}:
   - 進一步檢查建議(如: CT掃描、痰液檢查、血液檢查等)
   - 治療建議(藥物治療、手術等)
   - 追蹤建議
5. {referral}: 建議就診的科別及就醫時機

{disclaimer}
"
      ),
      Language::En => format!(
        "You are an experienced radiologist. Please analyse this chest X-ray image.

Detected lesion types: {lesions}

Provide a professional medical analysis in English covering the following:

1. {findings}: describe in detail the abnormal findings observed on the X-ray
2. {diagnosis}: suggest possible medical diagnoses based on the lesion characteristics
3. {severity}: assess the severity of the condition (mild/moderate/severe)
4. {actions}:
   - further examinations (e.g. CT scan, sputum test, blood test)
   - treatment suggestions (medication, surgery, etc.)
   - follow-up suggestions
5. {referral}: which department to visit and how soon

{disclaimer}
"
      ),
    };

    Prompt(text)
  }

  /// 用户输入的原始提示词
  pub fn custom(text: impl Into<String>) -> Prompt {
    Prompt(text.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for Prompt {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}
