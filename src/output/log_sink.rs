// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/log_sink.rs - 日志输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::FrameMeta,
  model::{DetectedObject, DetectionResult, InferenceError},
  output::{ErrorSink, OutputError, ResultSink},
};

const UNKNOWN_LABEL: &str = "unknown";

/// 把每个检测到的对象写入日志
///
/// URL 形式为 `log://`，加上 `?always` 时没有检测结果的帧也会记录。
#[derive(Debug, Clone, Default)]
pub struct LogSink {
  always: bool,
}

impl FromUrlWithScheme for LogSink {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogSink {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    let always = url.query_pairs().any(|(k, _)| k == "always");
    Ok(LogSink { always })
  }
}

impl LogSink {
  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }
}

/// 取第一个标签；没有标签时为 `("unknown", 0.0)`
pub fn top_label_of(object: &DetectedObject) -> (&str, f32) {
  object
    .top_label()
    .map(|label| (label.text.as_str(), label.confidence))
    .unwrap_or((UNKNOWN_LABEL, 0.0))
}

impl ResultSink for LogSink {
  fn deliver(&self, meta: &FrameMeta, result: &DetectionResult) {
    if result.is_empty() {
      if self.always {
        info!("帧 {} (时间: {}ms): 未检测到对象", meta.index, meta.timestamp_ms);
      }
      return;
    }

    info!(
      "帧 {} (时间: {}ms): 检测到 {} 个对象",
      meta.index,
      meta.timestamp_ms,
      result.len()
    );
    for object in &result.objects {
      let (label, confidence) = top_label_of(object);
      let bbox = &object.bounding_box;
      info!(
        "  - 检测到对象: {}, 置信度: {:.2} at ({:.0}, {:.0}, {:.0}x{:.0})",
        label,
        confidence,
        bbox.left,
        bbox.top,
        bbox.width(),
        bbox.height()
      );
    }
  }
}

impl ErrorSink for LogSink {
  fn report(&self, meta: &FrameMeta, error: &InferenceError) {
    warn!("帧 {} 推理失败: {}", meta.index, error);
  }
}
