// 该文件是 Kanjian （看见） 项目的一部分。
// src/processor/object_detector.rs - 目标检测处理器
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

use tracing::{debug, error};

use crate::{
  frame::{FrameMeta, InputImage},
  model::{DetectedObject, DetectionResult, Engine, EngineCompletion, InferenceError},
  output::{ErrorSink, ResultSink},
  processor::Detector,
};

/// 基于异步 [`Engine`] 的目标检测器
pub struct ObjectDetectorProcessor<E: Engine> {
  engine: E,
}

impl<E: Engine> ObjectDetectorProcessor<E> {
  pub fn new(engine: E) -> Self {
    Self { engine }
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }
}

impl<E: Engine> Detector for ObjectDetectorProcessor<E> {
  type Output = Vec<DetectedObject>;

  fn detect_in_image(&self, image: InputImage) -> Result<EngineCompletion, InferenceError> {
    self.engine.process(image)
  }

  fn on_success(&self, objects: Vec<DetectedObject>, meta: &FrameMeta, sink: &dyn ResultSink) {
    debug!("第 {} 帧检测到 {} 个对象", meta.index, objects.len());
    let result = DetectionResult {
      frame_index: meta.index,
      objects,
    };
    sink.deliver(meta, &result);
  }

  fn on_failure(&self, error: &InferenceError, meta: &FrameMeta, sink: &dyn ErrorSink) {
    error!("第 {} 帧目标检测失败: {}", meta.index, error);
    sink.report(meta, error);
  }

  fn stop(&self) {
    if let Err(e) = self.engine.close() {
      error!("关闭目标检测器时出错: {}", e);
    }
  }
}
