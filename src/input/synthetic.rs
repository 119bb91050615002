// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/synthetic.rs - 合成测试图案摄像头
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

use tracing::{error, trace};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{BufferPool, Frame, InputImage, Rotation, rgb_len},
  input::{FramePacer, FrameSource, InputError, SourceFormat, common_params},
  query_param,
};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;

/// 产生滚动渐变图案的摄像头，用于没有真实设备时驱动流水线
///
/// `synthetic://camera?width=&height=&fps=&rotate=&pool=&frames=`，
/// `fps=0` 表示不限速，`frames` 限制总采样次数。
#[derive(Debug)]
pub struct SyntheticCamera {
  width: u32,
  height: u32,
  fps: u32,
  rotation: Rotation,
  frames: Option<u64>,
  pool: BufferPool,
  pacer: FramePacer,
}

impl FromUrlWithScheme for SyntheticCamera {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticCamera {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch);
    }

    let (rotation, pool) = common_params(url)?;
    let width = query_param(url, "width").unwrap_or(DEFAULT_WIDTH);
    let height = query_param(url, "height").unwrap_or(DEFAULT_HEIGHT);
    let fps = query_param(url, "fps").unwrap_or(DEFAULT_FPS);

    let mut camera = SyntheticCamera::new(width, height, fps)
      .with_rotation(rotation)
      .with_pool_size(pool);
    camera.frames = query_param(url, "frames");
    Ok(camera)
  }
}

impl SyntheticCamera {
  pub fn new(width: u32, height: u32, fps: u32) -> Self {
    Self {
      width: width.max(1),
      height: height.max(1),
      fps,
      rotation: Rotation::Deg0,
      frames: None,
      pool: BufferPool::new(super::DEFAULT_POOL_SIZE),
      pacer: FramePacer::new(fps),
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = rotation;
    self
  }

  pub fn with_pool_size(mut self, size: usize) -> Self {
    self.pool = BufferPool::new(size);
    self
  }

  pub fn with_frame_limit(mut self, frames: Option<u64>) -> Self {
    self.frames = frames;
    self
  }

  fn render_pattern(&self, index: u64) -> Vec<u8> {
    let shift = index as u32;
    let mut data = Vec::with_capacity(rgb_len(self.width, self.height));
    for y in 0..self.height {
      for x in 0..self.width {
        data.push((x.wrapping_add(shift) & 0xFF) as u8);
        data.push((y & 0xFF) as u8);
        data.push((shift.wrapping_mul(4) & 0xFF) as u8);
      }
    }
    data
  }
}

impl Iterator for SyntheticCamera {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.frames.is_some_and(|limit| self.pacer.ticks() >= limit) {
      return None;
    }

    let (index, timestamp_ms) = self.pacer.tick();
    let Some(lease) = self.pool.try_acquire() else {
      trace!("第 {} 次采样没有可用缓冲", index);
      return Some(Err(InputError::PoolExhausted));
    };

    let frame = InputImage::from_rgb(
      self.width,
      self.height,
      self.render_pattern(index),
      self.rotation,
    )
    .map(|image| Frame::new(image, index, timestamp_ms, lease))
    .map_err(InputError::from);
    Some(frame)
  }
}

impl FrameSource for SyntheticCamera {
  fn format(&self) -> SourceFormat {
    SourceFormat {
      width: self.width,
      height: self.height,
      fps: self.fps,
    }
  }

  fn pool(&self) -> &BufferPool {
    &self.pool
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_url() {
    let url = Url::parse("synthetic://camera?width=32&height=24&fps=0&rotate=90&pool=2&frames=5")
      .unwrap();
    let camera = SyntheticCamera::from_url(&url).unwrap();
    assert_eq!(camera.format().width, 32);
    assert_eq!(camera.format().fps, 0);
    assert_eq!(camera.rotation, Rotation::Deg90);
    assert_eq!(camera.pool().capacity(), 2);
    assert_eq!(camera.frames, Some(5));
  }

  #[test]
  fn frames_carry_meta_and_stop_at_limit() {
    let camera = SyntheticCamera::new(4, 3, 0)
      .with_rotation(Rotation::Deg180)
      .with_frame_limit(Some(3));

    let frames = camera.map(|f| f.unwrap()).collect::<Vec<_>>();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].meta().index, 2);
    assert_eq!(frames[0].meta().rotation, Rotation::Deg180);
    assert_eq!(frames[0].image().as_nhwc().len(), 4 * 3 * 3);
    assert_eq!(frames[1].image().pixel(0, 0), Some([1, 0, 4]));
  }

  #[test]
  fn exhausted_pool_yields_starved_tick() {
    let mut camera = SyntheticCamera::new(2, 2, 0).with_pool_size(1);
    let held = camera.next().unwrap().unwrap();
    assert!(matches!(camera.next(), Some(Err(InputError::PoolExhausted))));

    held.release();
    let frame = camera.next().unwrap().unwrap();
    // 没有缓冲的那次采样同样消耗了一个序号
    assert_eq!(frame.meta().index, 2);
    assert_eq!(camera.pool().stats().acquired, 2);
  }
}
