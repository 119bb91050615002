// 该文件是 Kanjian （看见） 项目的一部分。
// src/frame.rs - 帧、图像缓冲与缓冲池定义
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

//! # 帧与缓冲池
//!
//! 摄像头缓冲区是一个有界资源池。每一帧在采集时从 [`BufferPool`] 中租用一个槽位
//! （[`BufferLease`]），并且必须恰好归还一次：
//!
//! - 显式调用 [`Frame::release`] / [`BufferLease::release`]；
//! - 或者在 [`Frame`] / [`BufferLease`] 被丢弃时自动归还。
//!
//! 归还操作消耗所有权，因此重复归还在类型层面不可能发生；
//! 泄漏则可以通过 [`PoolStats`] 观察到。

use std::sync::{
  Arc,
  atomic::{AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::trace;

const RGB_CHANNELS: usize = 3;

/// RGB 图像的字节数，按 `usize` 计算
pub(crate) fn rgb_len(width: u32, height: u32) -> usize {
  RGB_CHANNELS * width as usize * height as usize
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("不支持的旋转角度: {0}")]
  InvalidRotation(u32),
}

/// 画面旋转角度（顺时针）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn from_degrees(degrees: u32) -> Result<Self, FrameError> {
    match degrees % 360 {
      0 => Ok(Rotation::Deg0),
      90 => Ok(Rotation::Deg90),
      180 => Ok(Rotation::Deg180),
      270 => Ok(Rotation::Deg270),
      _ => Err(FrameError::InvalidRotation(degrees)),
    }
  }

  pub fn degrees(self) -> u32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }

  /// 旋转后宽高是否互换
  pub fn swaps_axes(self) -> bool {
    matches!(self, Rotation::Deg90 | Rotation::Deg270)
  }
}

/// 帧元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
  /// 缓冲区宽度
  pub width: u32,
  /// 缓冲区高度
  pub height: u32,
  /// 旋转角度
  pub rotation: Rotation,
}

impl FrameMeta {
  /// 按旋转角度校正后的画面尺寸，检测框坐标以此为准
  pub fn upright_size(&self) -> (u32, u32) {
    if self.rotation.swaps_axes() {
      (self.height, self.width)
    } else {
      (self.width, self.height)
    }
  }
}

/// 送入推理引擎的图像（RGB NHWC 排列）
///
/// 像素数据以 `Arc` 共享，克隆代价很低；引擎持有图像不会延长缓冲池槽位的占用。
#[derive(Clone)]
pub struct InputImage {
  data: Arc<[u8]>,
  width: u32,
  height: u32,
  rotation: Rotation,
}

impl std::fmt::Debug for InputImage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InputImage")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("rotation", &self.rotation)
      .field("bytes", &self.data.len())
      .finish()
  }
}

impl InputImage {
  pub fn from_rgb(
    width: u32,
    height: u32,
    data: Vec<u8>,
    rotation: Rotation,
  ) -> Result<Self, FrameError> {
    let expected = rgb_len(width, height);
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into(),
      width,
      height,
      rotation,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
    Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
  }
}

#[derive(Debug)]
struct PoolInner {
  capacity: usize,
  outstanding: AtomicUsize,
  acquired: AtomicU64,
  released: AtomicU64,
}

/// 缓冲池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  pub capacity: usize,
  /// 当前被租用、尚未归还的槽位数
  pub outstanding: usize,
  pub acquired: u64,
  pub released: u64,
}

/// 有界摄像头缓冲池
#[derive(Debug, Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

impl BufferPool {
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        capacity,
        outstanding: AtomicUsize::new(0),
        acquired: AtomicU64::new(0),
        released: AtomicU64::new(0),
      }),
    }
  }

  /// 租用一个槽位，池已耗尽时返回 `None`
  pub fn try_acquire(&self) -> Option<BufferLease> {
    let capacity = self.inner.capacity;
    self
      .inner
      .outstanding
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        (n < capacity).then_some(n + 1)
      })
      .ok()?;
    self.inner.acquired.fetch_add(1, Ordering::Relaxed);

    Some(BufferLease {
      pool: Some(self.inner.clone()),
    })
  }

  pub fn capacity(&self) -> usize {
    self.inner.capacity
  }

  pub fn available(&self) -> usize {
    self.inner.capacity - self.inner.outstanding.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats {
      capacity: self.inner.capacity,
      outstanding: self.inner.outstanding.load(Ordering::Acquire),
      acquired: self.inner.acquired.load(Ordering::Relaxed),
      released: self.inner.released.load(Ordering::Relaxed),
    }
  }
}

/// 缓冲池槽位租约，归还恰好发生一次
#[derive(Debug)]
pub struct BufferLease {
  pool: Option<Arc<PoolInner>>,
}

impl BufferLease {
  pub fn release(mut self) {
    self.give_back();
  }

  fn give_back(&mut self) {
    if let Some(pool) = self.pool.take() {
      pool.outstanding.fetch_sub(1, Ordering::AcqRel);
      pool.released.fetch_add(1, Ordering::Relaxed);
      trace!("缓冲槽位已归还");
    }
  }
}

impl Drop for BufferLease {
  fn drop(&mut self) {
    self.give_back();
  }
}

/// 一帧摄像头画面：图像、元数据与缓冲池租约
#[derive(Debug)]
pub struct Frame {
  image: InputImage,
  meta: FrameMeta,
  lease: BufferLease,
}

impl Frame {
  pub fn new(image: InputImage, index: u64, timestamp_ms: u64, lease: BufferLease) -> Self {
    let meta = FrameMeta {
      index,
      timestamp_ms,
      width: image.width(),
      height: image.height(),
      rotation: image.rotation(),
    };
    Self { image, meta, lease }
  }

  pub fn meta(&self) -> &FrameMeta {
    &self.meta
  }

  pub fn image(&self) -> &InputImage {
    &self.image
  }

  pub fn into_parts(self) -> (InputImage, FrameMeta, BufferLease) {
    (self.image, self.meta, self.lease)
  }

  pub fn from_parts(image: InputImage, meta: FrameMeta, lease: BufferLease) -> Self {
    Self { image, meta, lease }
  }

  /// 显式释放该帧占用的缓冲槽位
  pub fn release(self) {
    self.lease.release();
  }
}
