// 该文件是 Kanjian （看见） 项目的一部分。
// src/model.rs - 检测结果与推理引擎
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::InputImage;

pub mod completion;
pub use self::completion::{Abandoned, Completion, Resolver};

mod engine;
pub use self::engine::ModelEngine;

mod replay;
pub use self::replay::{ReplayError, ReplayModel};

/// 推理失败的分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("推理引擎不可用: {0}")]
  EngineUnavailable(String),
  #[error("输入图像无效: {0}")]
  MalformedInput(String),
  #[error("推理超时: {0:?}")]
  Timeout(Duration),
  #[error("推理内部错误: {0}")]
  Internal(String),
}

impl From<Abandoned> for InferenceError {
  fn from(_: Abandoned) -> Self {
    InferenceError::EngineUnavailable("请求在完成前被引擎放弃".to_string())
  }
}

/// 检测框，坐标为校正旋转后的画面像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl BoundingBox {
  pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  pub fn width(&self) -> f32 {
    (self.right - self.left).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.bottom - self.top).max(0.0)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
  pub text: String,
  pub confidence: f32,
  #[serde(default)]
  pub index: u32,
}

impl Label {
  /// 置信度被限制在 [0, 1] 区间内
  pub fn new(text: impl Into<String>, confidence: f32, index: u32) -> Self {
    Self {
      text: text.into(),
      confidence: clamp_confidence(confidence),
      index,
    }
  }
}

pub(crate) fn clamp_confidence(confidence: f32) -> f32 {
  if confidence.is_nan() {
    0.0
  } else {
    confidence.clamp(0.0, 1.0)
  }
}

/// 一个检测到的目标：位置与按置信度排列的标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
  #[serde(rename = "box")]
  pub bounding_box: BoundingBox,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tracking_id: Option<u32>,
  #[serde(default)]
  pub labels: Vec<Label>,
}

impl DetectedObject {
  pub fn new(bounding_box: BoundingBox, labels: Vec<Label>) -> Self {
    Self {
      bounding_box,
      tracking_id: None,
      labels,
    }
  }

  pub fn with_tracking_id(mut self, tracking_id: u32) -> Self {
    self.tracking_id = Some(tracking_id);
    self
  }

  /// 置信度最高的标签（标签按顺序给出，取第一个）
  pub fn top_label(&self) -> Option<&Label> {
    self.labels.first()
  }
}

/// 一帧画面的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  pub frame_index: u64,
  pub objects: Vec<DetectedObject>,
}

impl DetectionResult {
  pub fn len(&self) -> usize {
    self.objects.len()
  }

  pub fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }
}

/// 同步推理模型，由 [`ModelEngine`] 放到工作线程上运行
pub trait Model: Send + 'static {
  type Error: Into<InferenceError>;

  fn infer(&self, input: &InputImage) -> Result<Vec<DetectedObject>, Self::Error>;
}

pub type EngineCompletion = Completion<Result<Vec<DetectedObject>, InferenceError>>;

/// 不透明的异步目标检测引擎
pub trait Engine: Send + Sync + 'static {
  /// 提交一张图像；引擎无法受理时同步返回错误
  fn process(&self, image: InputImage) -> Result<EngineCompletion, InferenceError>;

  /// 释放引擎资源，必须可重复调用
  fn close(&self) -> Result<(), InferenceError>;
}

impl<E: Engine> Engine for std::sync::Arc<E> {
  fn process(&self, image: InputImage) -> Result<EngineCompletion, InferenceError> {
    (**self).process(image)
  }

  fn close(&self) -> Result<(), InferenceError> {
    (**self).close()
  }
}
