// 该文件是 DeepMID 项目的一部分。
// src/page.rs - 页面会话状态机与页面控制器
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

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{codec::CodecError, prompt::Language, upload::UploadError};

mod deepmid;
mod deepvision;

pub use self::deepmid::{AnalysisMode, DeepMid, DeepMidReport, DeepMidRequest};
pub use self::deepvision::{BackendChoice, DeepVision, DeepVisionReport, DeepVisionRequest};

#[derive(Error, Debug)]
pub enum PageError {
  #[error("上一次分析仍在进行中")]
  Busy,
  #[error("upload error: {0}")]
  UploadError(#[from] UploadError),
  #[error("codec error: {0}")]
  CodecError(#[from] CodecError),
  #[error("io error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("worker failed: {0}")]
  WorkerError(String),
}

/// 一次分析的终态
#[derive(Debug, Clone)]
pub enum PageOutcome<R> {
  Completed(R),
  Error(String),
}

impl<R> PageOutcome<R> {
  pub fn report(&self) -> Option<&R> {
    match self {
      PageOutcome::Completed(report) => Some(report),
      PageOutcome::Error(_) => None,
    }
  }

  /// 通用错误横幅
  pub fn error_banner(&self, language: Language) -> Option<String> {
    match (self, language) {
      (PageOutcome::Completed(_), _) => None,
      (PageOutcome::Error(message), Language::En) => Some(format!("analysis failed: {message}")),
      (PageOutcome::Error(message), Language::ZhHant) => {
        Some(format!("分析過程中發生錯誤: {message}"))
      }
    }
  }
}

#[derive(Debug, Clone, Default)]
pub enum PageState<R> {
  #[default]
  Idle,
  Processing,
  Done(PageOutcome<R>),
}

impl<R> PageState<R> {
  pub fn name(&self) -> &'static str {
    match self {
      PageState::Idle => "idle",
      PageState::Processing => "processing",
      PageState::Done(_) => "done",
    }
  }
}

/// 跨交互保留的页面会话
#[derive(Debug, Clone)]
pub struct PageSession<R> {
  state: PageState<R>,
  updated_at: DateTime<Utc>,
}

impl<R> Default for PageSession<R> {
  fn default() -> Self {
    PageSession {
      state: PageState::Idle,
      updated_at: Utc::now(),
    }
  }
}

impl<R> PageSession<R> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> &PageState<R> {
    &self.state
  }

  pub fn updated_at(&self) -> DateTime<Utc> {
    self.updated_at
  }

  pub fn is_processing(&self) -> bool {
    matches!(self.state, PageState::Processing)
  }

  /// Idle/Done -> Processing；处理中再次提交返回 [`PageError::Busy`]
  pub fn begin(&mut self) -> Result<(), PageError> {
    if self.is_processing() {
      warn!("会话仍在处理中，拒绝新的分析请求");
      return Err(PageError::Busy);
    }
    self.transition(PageState::Processing);
    Ok(())
  }

  /// Processing -> Done
  pub fn finish(&mut self, outcome: PageOutcome<R>) -> &PageOutcome<R> {
    if !self.is_processing() {
      warn!("会话当前状态为 {}，直接写入结果", self.state.name());
    }
    self.transition(PageState::Done(outcome));
    match &self.state {
      PageState::Done(outcome) => outcome,
      _ => unreachable!(),
    }
  }

  /// 同步执行一次完整分析，逃逸的错误都转为 [`PageOutcome::Error`]
  pub fn submit<P>(&mut self, page: &P, request: P::Request) -> Result<&PageOutcome<R>, PageError>
  where
    P: Page<Report = R>,
  {
    self.begin()?;
    let outcome = run_page(page, request);
    Ok(self.finish(outcome))
  }

  fn transition(&mut self, next: PageState<R>) {
    info!("会话状态: {} -> {}", self.state.name(), next.name());
    self.state = next;
    self.updated_at = Utc::now();
  }
}

/// 执行页面处理并把错误折叠为错误结果
pub fn run_page<P: Page>(page: &P, request: P::Request) -> PageOutcome<P::Report> {
  info!("开始 {} 分析...", P::TITLE);
  let now = std::time::Instant::now();
  match page.process(request) {
    Ok(report) => {
      info!("{} 分析完成，耗时: {:.2?}", P::TITLE, now.elapsed());
      PageOutcome::Completed(report)
    }
    Err(e) => {
      error!("{} 分析失败: {}", P::TITLE, e);
      PageOutcome::Error(e.to_string())
    }
  }
}

/// 页面控制器
pub trait Page {
  type Request;
  type Report;

  const TITLE: &'static str;

  fn language(&self) -> Language;

  /// 侧边栏说明（Markdown）
  fn help(&self) -> &'static str;

  fn process(&self, request: Self::Request) -> Result<Self::Report, PageError>;
}
