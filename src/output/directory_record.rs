// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  model::DetectedObject,
  output::{OverlayRenderer, OverlaySnapshot},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[cfg(feature = "save_image_file")]
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Serialize)]
struct FrameRecord<'a> {
  frame: u64,
  timestamp_ms: u64,
  width: u32,
  height: u32,
  rotation: u32,
  objects: Vec<&'a DetectedObject>,
}

/// 把每次重绘写入按日期分层的目录
///
/// URL 形式为 `folder:///path/to/dir`，可选参数：
///
/// - `always`：没有检测结果时也写入记录；
/// - `record`：只写 JSON 记录，不绘制 PNG。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: u16,
  always: bool,
  draw: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DirectoryRecordError::SchemeMismatch);
    }

    let always = url.query_pairs().any(|(k, _)| k == "always");
    let record_only = url.query_pairs().any(|(k, _)| k == "record");

    Ok(Self::new(decode_url_path(url))
      .always(always)
      .with_image(!record_only))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      frame_counter: 0,
      always: false,
      draw: cfg!(feature = "save_image_file"),
    }
  }

  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  /// 未启用 `save_image_file` 时始终只写记录
  pub fn with_image(mut self, draw: bool) -> Self {
    self.draw = draw && cfg!(feature = "save_image_file");
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&mut self) -> u16 {
    self.frame_counter = self.frame_counter.wrapping_add(1);
    self.frame_counter
  }

  /// 生成不带扩展名的记录路径：`<dir>/YYYY/MM/DD/HH-MM-SS-XXXX`
  fn frame_path(&mut self) -> Result<PathBuf, DirectoryRecordError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl OverlayRenderer for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn draw(&mut self, snapshot: &OverlaySnapshot) -> Result<(), Self::Error> {
    if !self.always && snapshot.graphics.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    let (width, height) = snapshot.frame.upright_size();
    let record = FrameRecord {
      frame: snapshot.frame.index,
      timestamp_ms: snapshot.frame.timestamp_ms,
      width,
      height,
      rotation: snapshot.frame.rotation.degrees(),
      objects: snapshot.graphics.iter().map(|g| &g.object).collect(),
    };
    std::fs::write(path.with_extension("json"), serde_json::to_vec_pretty(&record)?)?;

    #[cfg(feature = "save_image_file")]
    if self.draw {
      crate::output::draw::render_snapshot(snapshot).save(path.with_extension("png"))?;
    }

    trace!("第 {} 帧记录已写入 {}", snapshot.frame.index, path.display());
    Ok(())
  }
}
