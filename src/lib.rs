// 该文件是 DeepMID 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod annotate;
pub mod codec;
pub mod config;
pub mod detector;
pub mod page;
pub mod prompt;
pub mod upload;
pub mod vision;

#[cfg(feature = "server")]
pub mod server;

/// 从 URL 构造后端（检测或视觉语言模型）
pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;

  /// 方案是否匹配，`<scheme>+http` 视为同一后端的明文 HTTP 变体
  fn scheme_matches(scheme: &str) -> bool {
    scheme == Self::SCHEME
      || scheme
        .strip_prefix(Self::SCHEME)
        .is_some_and(|rest| rest == "+http" || rest == "+https")
  }
}

/// 由后端 URL 推导实际请求的 HTTP 基础地址
///
/// `roboflow://host/path` 默认走 HTTPS，`roboflow+http://host/path` 走明文 HTTP。
pub(crate) fn http_base(url: &url::Url, default_secure: bool) -> Option<String> {
  let mut base = http_origin(url, default_secure)?;
  base.push_str(url.path().trim_end_matches('/'));
  Some(base)
}

/// 只保留协议、主机与端口
pub(crate) fn http_origin(url: &url::Url, default_secure: bool) -> Option<String> {
  let secure = match url.scheme().split_once('+') {
    Some((_, "http")) => false,
    Some((_, "https")) => true,
    _ => default_secure,
  };
  let host = url.host_str()?;
  let scheme = if secure { "https" } else { "http" };
  Some(match url.port() {
    Some(port) => format!("{scheme}://{host}:{port}"),
    None => format!("{scheme}://{host}"),
  })
}

/// 读取 URL 查询参数
pub(crate) fn query_param(url: &url::Url, key: &str) -> Option<String> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.into_owned())
}

const SECRET_PARAMS: &[&str] = &["api_key", "key", "token"];

/// 隐去 URL 中的凭证（密码与 `api_key` 等查询参数），用于日志输出
pub fn redact_url(url: &url::Url) -> url::Url {
  let mut redacted = url.clone();
  if redacted.password().is_some() {
    let _ = redacted.set_password(Some("***"));
  }
  if url.query().is_some() {
    let pairs: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| {
        let v = if SECRET_PARAMS.contains(&k.as_ref()) {
          "***".to_string()
        } else {
          v.into_owned()
        };
        (k.into_owned(), v)
      })
      .collect();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
  }
  redacted
}
