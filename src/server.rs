// 该文件是 DeepMID 项目的一部分。
// src/server.rs - HTTP 页面服务
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

use std::{
  collections::HashMap,
  future::Future,
  sync::{Arc, Mutex},
  time::Duration,
};

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
  http::{StatusCode, header},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  codec::{CodecError, encode_base64},
  detector::DetectorWrapper,
  page::{
    AnalysisMode, BackendChoice, DeepMid, DeepMidReport, DeepMidRequest, DeepVision,
    DeepVisionReport, DeepVisionRequest, Page, PageError, PageOutcome, PageSession, PageState,
    run_page,
  },
  prompt::Language,
  upload::UploadedImage,
  vision::{AnalysisResult, VisionWrapper},
};

/// 上传大小上限
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub type DeepMidPage = DeepMid<DetectorWrapper, VisionWrapper>;
pub type DeepVisionPage = DeepVision<VisionWrapper>;

/// 会话在最后一次状态变化后保留的时长
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);
/// 每个页面保留的会话数上限
pub const DEFAULT_MAX_SESSIONS: usize = 256;

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("missing form field '{0}'")]
  MissingField(&'static str),
  #[error("invalid value '{value}' for field '{field}'")]
  InvalidField { field: &'static str, value: String },
  #[error("multipart error: {0}")]
  MultipartError(#[from] MultipartError),
  #[error("session {0} not found")]
  SessionNotFound(Uuid),
  #[error(transparent)]
  PageError(#[from] PageError),
  #[error("codec error: {0}")]
  CodecError(#[from] CodecError),
  #[error("session store poisoned")]
  Poisoned,
  #[error("io error: {0}")]
  IoError(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
  fn into_response(self) -> Response {
    let status = match self {
      ServerError::MissingField(_)
      | ServerError::InvalidField { .. }
      | ServerError::MultipartError(_) => StatusCode::BAD_REQUEST,
      ServerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
      ServerError::PageError(PageError::Busy) => StatusCode::CONFLICT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      error!("请求处理失败: {}", self);
    } else {
      warn!("请求被拒绝: {}", self);
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

/// 单个页面的会话表
///
/// 新会话加入前清理超过保留时长的会话；数量仍超出上限时，依次移除最久未更新的会话。
/// 处理中的会话不会被清理。
pub struct SessionStore<R> {
  sessions: Mutex<HashMap<Uuid, PageSession<R>>>,
  ttl: Duration,
  capacity: usize,
}

impl<R> SessionStore<R> {
  pub fn new(ttl: Duration, capacity: usize) -> Self {
    SessionStore {
      sessions: Mutex::new(HashMap::new()),
      ttl,
      capacity: capacity.max(1),
    }
  }

  fn with_session<T>(
    &self,
    id: Uuid,
    f: impl FnOnce(&mut PageSession<R>) -> Result<T, ServerError>,
  ) -> Result<T, ServerError> {
    let mut sessions = self.sessions.lock().map_err(|_| ServerError::Poisoned)?;
    if !sessions.contains_key(&id) {
      prune_sessions(&mut sessions, Utc::now(), self.ttl, self.capacity - 1);
    }
    f(sessions.entry(id).or_default())
  }

  fn with_existing<T>(
    &self,
    id: Uuid,
    f: impl FnOnce(&PageSession<R>) -> Result<T, ServerError>,
  ) -> Result<T, ServerError> {
    let sessions = self.sessions.lock().map_err(|_| ServerError::Poisoned)?;
    f(sessions.get(&id).ok_or(ServerError::SessionNotFound(id))?)
  }
}

impl<R> Default for SessionStore<R> {
  fn default() -> Self {
    Self::new(DEFAULT_SESSION_TTL, DEFAULT_MAX_SESSIONS)
  }
}

fn is_expired<R>(session: &PageSession<R>, now: DateTime<Utc>, ttl: Duration) -> bool {
  (now - session.updated_at())
    .to_std()
    .is_ok_and(|age| age > ttl)
}

/// 移除过期会话，并把空闲会话数压到 `room` 以内
fn prune_sessions<R>(
  sessions: &mut HashMap<Uuid, PageSession<R>>,
  now: DateTime<Utc>,
  ttl: Duration,
  room: usize,
) {
  let before = sessions.len();
  sessions.retain(|_, session| session.is_processing() || !is_expired(session, now, ttl));

  while sessions.len() > room {
    let oldest = sessions
      .iter()
      .filter(|(_, session)| !session.is_processing())
      .min_by_key(|(_, session)| session.updated_at())
      .map(|(id, _)| *id);
    match oldest {
      Some(id) => {
        sessions.remove(&id);
      }
      None => break,
    }
  }

  let removed = before - sessions.len();
  if removed > 0 {
    debug!("清理会话 {} 个，剩余 {} 个", removed, sessions.len());
  }
}

/// 服务共享状态：两个页面控制器与各自的会话表
pub struct AppState {
  deepmid: Arc<DeepMidPage>,
  deepvision: Arc<DeepVisionPage>,
  deepmid_sessions: Arc<SessionStore<DeepMidReport>>,
  deepvision_sessions: Arc<SessionStore<DeepVisionReport>>,
}

impl AppState {
  pub fn new(deepmid: DeepMidPage, deepvision: DeepVisionPage) -> Self {
    AppState {
      deepmid: Arc::new(deepmid),
      deepvision: Arc::new(deepvision),
      deepmid_sessions: Arc::default(),
      deepvision_sessions: Arc::default(),
    }
  }

  /// 设置会话保留时长与数量上限
  pub fn with_session_limits(mut self, ttl: Duration, capacity: usize) -> Self {
    info!("会话保留时长: {:?}，上限: {}", ttl, capacity);
    self.deepmid_sessions = Arc::new(SessionStore::new(ttl, capacity));
    self.deepvision_sessions = Arc::new(SessionStore::new(ttl, capacity));
    self
  }
}

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/health", get(health))
    .route("/deepmid/help", get(deepmid_help))
    .route("/deepvision/help", get(deepvision_help))
    .route("/deepmid/analyze", post(deepmid_analyze))
    .route("/deepvision/analyze", post(deepvision_analyze))
    .route("/deepmid/sessions/:id", get(deepmid_session))
    .route("/deepvision/sessions/:id", get(deepvision_session))
    .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
    .with_state(state)
}

/// 在给定监听器上运行服务，`shutdown` 完成后优雅退出
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<(), ServerError>
where
  F: Future<Output = ()> + Send + 'static,
{
  info!("服务监听于 http://{}", listener.local_addr()?);
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await?;
  info!("服务已停止");
  Ok(())
}

async fn index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
  Json(json!({
    "pages": [
      {
        "title": DeepMidPage::TITLE,
        "route": "/deepmid",
        "language": state.deepmid.language(),
      },
      {
        "title": DeepVisionPage::TITLE,
        "route": "/deepvision",
        "language": state.deepvision.language(),
      },
    ]
  }))
}

async fn health() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

fn markdown(text: &'static str) -> impl IntoResponse {
  ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], text)
}

async fn deepmid_help(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  markdown(state.deepmid.help())
}

async fn deepvision_help(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  markdown(state.deepvision.help())
}

/// 一次分析请求的表单内容，图像在工作线程中再校验
#[derive(Default)]
struct AnalyzeForm {
  file: Option<(Vec<u8>, Option<String>)>,
  fields: HashMap<String, String>,
}

impl AnalyzeForm {
  async fn read(mut multipart: Multipart) -> Result<Self, ServerError> {
    let mut form = AnalyzeForm::default();
    while let Some(field) = multipart.next_field().await? {
      let name = field.name().unwrap_or_default().to_string();
      if name == "file" {
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        form.file = Some((bytes.to_vec(), file_name));
      } else {
        let value = field.text().await?;
        form.fields.insert(name, value);
      }
    }
    Ok(form)
  }

  fn take_file(&mut self) -> Result<(Vec<u8>, Option<String>), ServerError> {
    self.file.take().ok_or(ServerError::MissingField("file"))
  }

  fn choice<T: ValueEnum + Default>(&self, field: &'static str) -> Result<T, ServerError> {
    match self.fields.get(field) {
      None => Ok(T::default()),
      Some(value) => T::from_str(value.trim(), true).map_err(|_| ServerError::InvalidField {
        field,
        value: value.clone(),
      }),
    }
  }

  /// 空白提示词视为未填写
  fn prompt(&self) -> Option<String> {
    self
      .fields
      .get("prompt")
      .filter(|value| !value.trim().is_empty())
      .cloned()
  }

  fn session(&self) -> Result<Uuid, ServerError> {
    match self.fields.get("session").map(|value| value.trim()) {
      None | Some("") => Ok(Uuid::new_v4()),
      Some(value) => Uuid::parse_str(value).map_err(|_| ServerError::InvalidField {
        field: "session",
        value: value.to_string(),
      }),
    }
  }
}

/// 工作线程持有的结果写回句柄
///
/// 结果由工作线程写回会话，与请求连接是否仍然存在无关；
/// 未写回就被释放（工作线程 panic）时，会话以错误结束。
struct SessionFinisher<R> {
  store: Arc<SessionStore<R>>,
  id: Uuid,
  finished: bool,
}

impl<R> SessionFinisher<R> {
  fn finish(mut self, outcome: PageOutcome<R>) -> Result<(), ServerError> {
    self.finished = true;
    self.store.with_session(self.id, |session| {
      session.finish(outcome);
      Ok(())
    })?;
    info!("会话 {} 处理完成", self.id);
    Ok(())
  }
}

impl<R> Drop for SessionFinisher<R> {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    error!("会话 {} 的分析任务异常退出", self.id);
    let outcome = PageOutcome::Error(
      PageError::WorkerError("analysis worker exited unexpectedly".to_string()).to_string(),
    );
    let _ = self.store.with_session(self.id, |session| {
      session.finish(outcome);
      Ok(())
    });
  }
}

/// Idle/Done -> Processing -> Done，处理在阻塞线程池中进行
async fn run_in_session<P, F>(
  page: Arc<P>,
  store: &Arc<SessionStore<P::Report>>,
  id: Uuid,
  build: F,
) -> Result<(), ServerError>
where
  P: Page + Send + Sync + 'static,
  P::Report: Send + 'static,
  F: FnOnce() -> Result<P::Request, PageError> + Send + 'static,
{
  store.with_session(id, |session| Ok(session.begin()?))?;
  info!("会话 {} 开始处理", id);

  let finisher = SessionFinisher {
    store: store.clone(),
    id,
    finished: false,
  };
  let job = tokio::task::spawn_blocking(move || {
    let outcome = match build() {
      Ok(request) => run_page(&*page, request),
      Err(e) => {
        error!("请求无效: {}", e);
        PageOutcome::Error(e.to_string())
      }
    };
    finisher.finish(outcome)
  });

  match job.await {
    Ok(written) => written,
    Err(e) => Err(PageError::WorkerError(e.to_string()).into()),
  }
}

#[derive(Serialize)]
struct SessionView<V> {
  session: Uuid,
  state: &'static str,
  updated_at: String,
  result: Option<V>,
  error: Option<String>,
}

fn session_view<R, V>(
  id: Uuid,
  session: &PageSession<R>,
  language: Language,
  render: impl FnOnce(&R) -> Result<V, CodecError>,
) -> Result<SessionView<V>, ServerError> {
  let (result, error) = match session.state() {
    PageState::Done(outcome) => (
      outcome.report().map(render).transpose()?,
      outcome.error_banner(language),
    ),
    _ => (None, None),
  };
  Ok(SessionView {
    session: id,
    state: session.state().name(),
    updated_at: session.updated_at().to_rfc3339(),
    result,
    error,
  })
}

#[derive(Serialize)]
struct DeepMidView {
  mode: AnalysisMode,
  original: String,
  annotated: Option<String>,
  annotation_warning: Option<&'static str>,
  lesions: Vec<String>,
  lesion_notice: String,
  prompt: String,
  analysis: AnalysisResult,
  analysis_text: String,
  disclaimer: &'static str,
}

impl DeepMidView {
  fn render(report: &DeepMidReport) -> Result<Self, CodecError> {
    Ok(DeepMidView {
      mode: report.mode,
      original: encode_base64(&report.original)?.data_url(),
      annotated: report
        .annotated()
        .map(|image| encode_base64(image).map(|encoded| encoded.data_url()))
        .transpose()?,
      annotation_warning: report.annotation_warning(),
      lesions: report
        .detection
        .labels()
        .map(|labels| labels.iter().map(str::to_string).collect())
        .unwrap_or_default(),
      lesion_notice: report.lesion_notice(),
      prompt: report.prompt.to_string(),
      analysis: report.analysis.clone(),
      analysis_text: report.analysis_text(),
      disclaimer: report.disclaimer(),
    })
  }
}

#[derive(Serialize)]
struct DeepVisionView {
  backend: BackendChoice,
  original: String,
  prompt: String,
  analysis: AnalysisResult,
  analysis_text: String,
}

impl DeepVisionView {
  fn render(report: &DeepVisionReport) -> Result<Self, CodecError> {
    Ok(DeepVisionView {
      backend: report.backend,
      original: encode_base64(&report.original)?.data_url(),
      prompt: report.prompt.to_string(),
      analysis: report.analysis.clone(),
      analysis_text: report.analysis_text(),
    })
  }
}

async fn deepmid_analyze(
  State(state): State<Arc<AppState>>,
  multipart: Multipart,
) -> Result<Json<SessionView<DeepMidView>>, ServerError> {
  let mut form = AnalyzeForm::read(multipart).await?;
  let (bytes, file_name) = form.take_file()?;
  let mode: AnalysisMode = form.choice("mode")?;
  let prompt = form.prompt();
  let id = form.session()?;

  run_in_session(state.deepmid.clone(), &state.deepmid_sessions, id, move || {
    let upload = UploadedImage::new(bytes, file_name.as_deref())?;
    Ok(DeepMidRequest {
      upload,
      mode,
      prompt,
    })
  })
  .await?;

  let language = state.deepmid.language();
  state.deepmid_sessions.with_existing(id, |session| {
    session_view(id, session, language, DeepMidView::render).map(Json)
  })
}

async fn deepvision_analyze(
  State(state): State<Arc<AppState>>,
  multipart: Multipart,
) -> Result<Json<SessionView<DeepVisionView>>, ServerError> {
  let mut form = AnalyzeForm::read(multipart).await?;
  let (bytes, file_name) = form.take_file()?;
  let backend: BackendChoice = form.choice("backend")?;
  let prompt = form.prompt();
  let id = form.session()?;

  run_in_session(state.deepvision.clone(), &state.deepvision_sessions, id, move || {
    let upload = UploadedImage::new(bytes, file_name.as_deref())?;
    Ok(DeepVisionRequest {
      upload,
      backend,
      prompt,
    })
  })
  .await?;

  let language = state.deepvision.language();
  state.deepvision_sessions.with_existing(id, |session| {
    session_view(id, session, language, DeepVisionView::render).map(Json)
  })
}

fn existing_view<R, V>(
  store: &SessionStore<R>,
  id: Uuid,
  language: Language,
  render: impl FnOnce(&R) -> Result<V, CodecError>,
) -> Result<Json<SessionView<V>>, ServerError> {
  store.with_existing(id, |session| session_view(id, session, language, render).map(Json))
}

async fn deepmid_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<Uuid>,
) -> Result<Json<SessionView<DeepMidView>>, ServerError> {
  existing_view(
    &state.deepmid_sessions,
    id,
    state.deepmid.language(),
    DeepMidView::render,
  )
}

async fn deepvision_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<Uuid>,
) -> Result<Json<SessionView<DeepVisionView>>, ServerError> {
  existing_view(
    &state.deepvision_sessions,
    id,
    state.deepvision.language(),
    DeepVisionView::render,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_status_codes() {
    let cases = [
      (ServerError::MissingField("file"), StatusCode::BAD_REQUEST),
      (ServerError::SessionNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
      (ServerError::PageError(PageError::Busy), StatusCode::CONFLICT),
      (ServerError::Poisoned, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (error, status) in cases {
      assert_eq!(error.into_response().status(), status);
    }
  }

  #[test]
  fn test_form_defaults_and_validation() {
    let mut form = AnalyzeForm::default();
    assert!(matches!(form.take_file(), Err(ServerError::MissingField("file"))));
    assert_eq!(form.choice::<AnalysisMode>("mode").unwrap(), AnalysisMode::Smart);
    assert!(form.prompt().is_none());
    assert!(form.session().is_ok());

    form.fields.insert("mode".to_string(), "Custom".to_string());
    form.fields.insert("backend".to_string(), "gpu".to_string());
    form.fields.insert("prompt".to_string(), "   ".to_string());
    form.fields.insert("session".to_string(), "not-a-uuid".to_string());
    assert_eq!(form.choice::<AnalysisMode>("mode").unwrap(), AnalysisMode::Custom);
    assert!(matches!(
      form.choice::<BackendChoice>("backend"),
      Err(ServerError::InvalidField { field: "backend", .. })
    ));
    assert!(form.prompt().is_none());
    assert!(form.session().is_err());
  }

  #[test]
  fn test_idle_session_view_has_no_result() {
    let session: PageSession<DeepVisionReport> = PageSession::new();
    let view = session_view(Uuid::nil(), &session, Language::En, DeepVisionView::render).unwrap();
    assert_eq!(view.state, "idle");
    assert!(view.result.is_none());
    assert!(view.error.is_none());
  }

  fn done_session() -> PageSession<DeepVisionReport> {
    let mut session = PageSession::new();
    session.begin().unwrap();
    session.finish(PageOutcome::Error("boom".to_string()));
    session
  }

  fn busy_session() -> PageSession<DeepVisionReport> {
    let mut session = PageSession::new();
    session.begin().unwrap();
    session
  }

  #[test]
  fn test_expired_sessions_are_pruned_but_busy_ones_kept() {
    let mut sessions = HashMap::new();
    let busy = Uuid::new_v4();
    sessions.insert(busy, busy_session());
    for _ in 0..3 {
      sessions.insert(Uuid::new_v4(), done_session());
    }

    // 尚未过期
    prune_sessions(&mut sessions, Utc::now(), DEFAULT_SESSION_TTL, 16);
    assert_eq!(sessions.len(), 4);

    let later = Utc::now() + chrono::Duration::hours(2);
    prune_sessions(&mut sessions, later, DEFAULT_SESSION_TTL, 16);
    assert_eq!(sessions.len(), 1);
    assert!(sessions[&busy].is_processing());
  }

  #[test]
  fn test_oldest_sessions_make_room_for_new_ones() {
    let mut sessions = HashMap::new();
    let busy = Uuid::new_v4();
    sessions.insert(busy, busy_session());
    let mut ids = Vec::new();
    for _ in 0..4 {
      let id = Uuid::new_v4();
      sessions.insert(id, done_session());
      ids.push(id);
      std::thread::sleep(Duration::from_millis(2));
    }

    prune_sessions(&mut sessions, Utc::now(), DEFAULT_SESSION_TTL, 3);
    assert_eq!(sessions.len(), 3);
    assert!(sessions.contains_key(&busy));
    assert!(!sessions.contains_key(&ids[0]));
    assert!(!sessions.contains_key(&ids[1]));
    assert!(sessions.contains_key(&ids[3]));

    // 全部处理中时不再移除
    let mut sessions: HashMap<Uuid, PageSession<DeepVisionReport>> =
      (0..3).map(|_| (Uuid::new_v4(), busy_session())).collect();
    prune_sessions(&mut sessions, Utc::now(), DEFAULT_SESSION_TTL, 1);
    assert_eq!(sessions.len(), 3);
  }

  #[test]
  fn test_store_stays_within_capacity() {
    let store: SessionStore<DeepVisionReport> = SessionStore::new(DEFAULT_SESSION_TTL, 2);
    let mut last = Uuid::nil();
    for _ in 0..5 {
      last = Uuid::new_v4();
      store
        .with_session(last, |session| {
          session.begin()?;
          session.finish(PageOutcome::Error("boom".to_string()));
          Ok(())
        })
        .unwrap();
    }
    assert_eq!(store.sessions.lock().unwrap().len(), 2);
    assert!(store.with_existing(last, |_| Ok(())).is_ok());
  }

  #[test]
  fn test_dropped_finisher_ends_session_with_error() {
    let store: Arc<SessionStore<DeepVisionReport>> = Arc::default();
    let id = Uuid::new_v4();
    store.with_session(id, |session| Ok(session.begin()?)).unwrap();

    drop(SessionFinisher {
      store: store.clone(),
      id,
      finished: false,
    });

    store
      .with_existing(id, |session| {
        assert!(!session.is_processing());
        let view = session_view(id, session, Language::En, DeepVisionView::render)?;
        assert_eq!(view.state, "done");
        assert!(view.error.unwrap().contains("worker"));
        Ok(())
      })
      .unwrap();
  }
}
