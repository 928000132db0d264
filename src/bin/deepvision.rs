// 该文件是 DeepMID 项目的一部分。
// src/bin/deepvision.rs - 命令行单次影像分析
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

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use deepmid::{
  config::BackendSettings,
  page::{BackendChoice, DeepVisionRequest, Page, PageOutcome, PageSession},
  upload::UploadedImage,
};

/// DeepVision 单次分析参数
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 待分析影像（jpg / jpeg / png）
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 视觉后端
  #[arg(long, value_enum, default_value_t = BackendChoice::Cloud)]
  pub backend: BackendChoice,
  /// 提示词
  #[arg(long)]
  pub prompt: Option<String>,
  #[command(flatten)]
  pub backends: BackendSettings,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("输入影像: {}", args.image.display());

  let page = args.backends.deepvision_page()?;
  let upload = UploadedImage::open(&args.image)?;
  let request = DeepVisionRequest {
    upload,
    backend: args.backend,
    prompt: args.prompt,
  };

  let mut session = PageSession::new();
  match session.submit(&page, request)? {
    PageOutcome::Completed(report) => println!("{}", report.analysis_text()),
    outcome => bail!(
      "{}",
      outcome.error_banner(page.language()).unwrap_or_default()
    ),
  }

  Ok(())
}
