// 该文件是 Kanjian （看见） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FrameMeta,
  model::{DetectionResult, InferenceError},
};

/// 检测结果输出
///
/// 在推理完成路径上被调用，该路径随后还要归还帧缓冲，因此实现不得阻塞。
pub trait ResultSink: Send + Sync {
  fn deliver(&self, meta: &FrameMeta, result: &DetectionResult);
}

/// 推理错误输出，约束同 [`ResultSink`]
pub trait ErrorSink: Send + Sync {
  fn report(&self, meta: &FrameMeta, error: &InferenceError);
}

impl<F> ResultSink for F
where
  F: Fn(&FrameMeta, &DetectionResult) + Send + Sync,
{
  fn deliver(&self, meta: &FrameMeta, result: &DetectionResult) {
    self(meta, result)
  }
}

impl<F> ErrorSink for F
where
  F: Fn(&FrameMeta, &InferenceError) + Send + Sync,
{
  fn report(&self, meta: &FrameMeta, error: &InferenceError) {
    self(meta, error)
  }
}

mod log_sink;
pub use self::log_sink::LogSink;

mod overlay;
pub use self::overlay::{GraphicOverlay, ObjectGraphic, OverlayRenderer, OverlaySnapshot};

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordError, DirectoryRecordOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordError(#[from] DirectoryRecordError),
  #[error("无法启动渲染线程: {0}")]
  RendererSpawnError(std::io::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  Log(LogSink),
  #[cfg(feature = "directory_record")]
  DirectoryRecord(GraphicOverlay),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() == LogSink::SCHEME {
      return Ok(OutputWrapper::Log(LogSink::from_url(url)?));
    }
    #[cfg(feature = "directory_record")]
    if url.scheme() == DirectoryRecordOutput::SCHEME {
      let renderer = DirectoryRecordOutput::from_url(url)?;
      let overlay =
        GraphicOverlay::with_renderer(renderer).map_err(OutputError::RendererSpawnError)?;
      return Ok(OutputWrapper::DirectoryRecord(overlay));
    }
    Err(OutputError::SchemeMismatch)
  }
}

impl OutputWrapper {
  /// 等待尚未完成的渲染并停止渲染线程
  pub fn finish(&self) {
    match self {
      OutputWrapper::Log(_) => {}
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecord(overlay) => overlay.finish(),
    }
  }
}

impl ResultSink for OutputWrapper {
  fn deliver(&self, meta: &FrameMeta, result: &DetectionResult) {
    match self {
      OutputWrapper::Log(sink) => sink.deliver(meta, result),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecord(overlay) => overlay.deliver(meta, result),
    }
  }
}

impl ErrorSink for OutputWrapper {
  fn report(&self, meta: &FrameMeta, error: &InferenceError) {
    match self {
      OutputWrapper::Log(sink) => sink.report(meta, error),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecord(_) => {
        tracing::warn!("第 {} 帧没有可绘制的结果: {}", meta.index, error)
      }
    }
  }
}
