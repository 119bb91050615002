// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/replay.rs - 回放检测结果的模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 回放模型
//!
//! 检测模型本身不属于本项目，这里提供一个确定性的替身：
//! 从 JSON Lines 文件中逐行读取预先录制的检测结果，每次推理返回下一行，循环播放。
//!
//! 每行格式：
//!
//! ```json
//! {"objects": [{"box": {"left": 10, "top": 10, "right": 50, "bottom": 50},
//!               "labels": [{"text": "cup", "confidence": 0.92}]}]}
//! ```
//!
//! 空行与 `#` 开头的行会被忽略。URL 形式为 `replay:///path/to/detections.jsonl?latency_ms=40`，
//! `latency_ms` 用于模拟推理耗时。

use std::{
  fs::File,
  io::{BufRead, BufReader},
  sync::atomic::{AtomicUsize, Ordering},
  thread,
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::InputImage,
  model::{DetectedObject, InferenceError, Model, clamp_confidence},
  query_param,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
  #[error("回放文件中没有任何记录")]
  Empty,
}

#[derive(Deserialize)]
struct ReplayRecord {
  #[serde(default)]
  objects: Vec<DetectedObject>,
}

#[derive(Debug)]
pub struct ReplayModel {
  records: Vec<Vec<DetectedObject>>,
  cursor: AtomicUsize,
  latency: Duration,
}

impl FromUrlWithScheme for ReplayModel {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModel {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch);
    }

    let path = decode_url_path(url);
    info!("加载回放文件: {}", path);
    let file = File::open(&path)?;
    let model = Self::from_reader(BufReader::new(file))?
      .with_latency(Duration::from_millis(query_param(url, "latency_ms").unwrap_or(0)));
    info!("回放记录数: {}", model.records.len());
    Ok(model)
  }
}

impl ReplayModel {
  pub fn from_records(records: Vec<Vec<DetectedObject>>) -> Result<Self, ReplayError> {
    if records.is_empty() {
      return Err(ReplayError::Empty);
    }

    let records = records
      .into_iter()
      .map(|objects| {
        objects
          .into_iter()
          .map(|mut object| {
            for label in object.labels.iter_mut() {
              label.confidence = clamp_confidence(label.confidence);
            }
            object
          })
          .collect()
      })
      .collect();

    Ok(Self {
      records,
      cursor: AtomicUsize::new(0),
      latency: Duration::ZERO,
    })
  }

  pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ReplayError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
      let line = line?;
      let trimmed = line.trim();
      if trimmed.is_empty() || trimmed.starts_with('#') {
        continue;
      }
      let record: ReplayRecord =
        serde_json::from_str(trimmed).map_err(|source| ReplayError::ParseError {
          line: index + 1,
          source,
        })?;
      records.push(record.objects);
    }
    Self::from_records(records)
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

impl Model for ReplayModel {
  type Error = InferenceError;

  fn infer(&self, input: &InputImage) -> Result<Vec<DetectedObject>, Self::Error> {
    if input.is_empty() || input.width() == 0 || input.height() == 0 {
      return Err(InferenceError::MalformedInput(format!(
        "图像尺寸无效: {}x{}",
        input.width(),
        input.height()
      )));
    }

    if !self.latency.is_zero() {
      thread::sleep(self.latency);
    }

    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.records.len();
    debug!("回放第 {} 条记录", index);
    Ok(self.records[index].clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Rotation;
  use std::io::{Cursor, Write};

  const TWO_FRAMES: &str = r#"
# cup then nothing
{"objects": [{"box": {"left": 10, "top": 10, "right": 50, "bottom": 50}, "labels": [{"text": "cup", "confidence": 0.92}]}]}
{"objects": []}
"#;

  fn image() -> InputImage {
    InputImage::from_rgb(4, 4, vec![0; 48], Rotation::Deg0).unwrap()
  }

  #[test]
  fn replays_records_in_a_cycle() {
    let model = ReplayModel::from_reader(Cursor::new(TWO_FRAMES)).unwrap();
    assert_eq!(model.len(), 2);

    let first = model.infer(&image()).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].labels[0].text, "cup");
    assert!(model.infer(&image()).unwrap().is_empty());
    assert_eq!(model.infer(&image()).unwrap(), first);
  }

  #[test]
  fn reports_bad_line_number() {
    let err = ReplayModel::from_reader(Cursor::new("{\"objects\": []}\nnot json\n")).unwrap_err();
    assert!(matches!(err, ReplayError::ParseError { line: 2, .. }));
  }

  #[test]
  fn empty_file_is_rejected() {
    let err = ReplayModel::from_reader(Cursor::new("# nothing\n")).unwrap_err();
    assert!(matches!(err, ReplayError::Empty));
  }

  #[test]
  fn clamps_recorded_confidence() {
    let model = ReplayModel::from_reader(Cursor::new(
      r#"{"objects": [{"box": {"left": 0, "top": 0, "right": 1, "bottom": 1}, "labels": [{"text": "x", "confidence": 3.5}]}]}"#,
    ))
    .unwrap();
    assert_eq!(model.infer(&image()).unwrap()[0].labels[0].confidence, 1.0);
  }

  #[test]
  fn loads_from_url_with_latency() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TWO_FRAMES.as_bytes()).unwrap();
    let url = Url::parse(&format!(
      "replay://{}?latency_ms=15",
      file.path().display()
    ))
    .unwrap();

    let model = ReplayModel::from_url(&url).unwrap();
    assert_eq!(model.latency, Duration::from_millis(15));
    assert_eq!(model.len(), 2);
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("onnx:///model.onnx").unwrap();
    assert!(matches!(
      ReplayModel::from_url(&url),
      Err(ReplayError::SchemeMismatch)
    ));
  }
}
