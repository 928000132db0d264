// 该文件是 DeepMID 项目的一部分。
// src/main.rs - DeepMID / DeepVision 页面服务入口
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use deepmid::{
  config::Settings,
  redact_url,
  server::{AppState, serve},
};

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("无法监听中断信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到中断信号，准备退出...");
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let settings = Settings::parse();
  info!("检测后端: {}", redact_url(&settings.backends.detector));
  info!("云端视觉后端: {}", redact_url(&settings.backends.cloud));
  info!("本机视觉后端: {}", redact_url(&settings.backends.local));

  // 阻塞 HTTP 客户端只能在异步运行时之外创建与释放
  let deepmid = settings.backends.deepmid_page()?;
  let deepvision = settings.backends.deepvision_page()?;
  let state = Arc::new(
    AppState::new(deepmid, deepvision).with_session_limits(
      Duration::from_secs(settings.session_ttl),
      settings.max_sessions,
    ),
  );

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  runtime.block_on(async {
    let listener = TcpListener::bind(settings.bind).await?;
    serve(listener, state.clone(), shutdown_signal()).await
  })?;
  drop(runtime);

  drop(state);
  Ok(())
}
