// 该文件是 Kanjian （看见） 项目的一部分。
// src/input.rs - 摄像头帧输入
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
  fmt,
  str::FromStr,
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{BufferPool, Frame, FrameError, Rotation},
  query_param,
};

mod synthetic;
pub use self::synthetic::SyntheticCamera;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lInput, V4lInputError};

/// 未指定 `pool` 参数时的缓冲池容量
pub const DEFAULT_POOL_SIZE: usize = 4;

/// 未指定深度时 `queue` 背压策略的队列深度
pub const DEFAULT_QUEUE_DEPTH: usize = 2;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("缓冲池已耗尽")]
  PoolExhausted,
  #[error("帧错误: {0}")]
  FrameError(#[from] FrameError),
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L 输入错误: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 输入源的原生格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
  pub width: u32,
  pub height: u32,
  /// 每秒帧数，0 表示不限速
  pub fps: u32,
}

/// 摄像头帧源：按原生速率产生帧，每帧占用自身缓冲池的一个槽位
///
/// 缓冲池耗尽时产生 [`InputError::PoolExhausted`]，该次采样没有帧，但帧源仍可继续。
pub trait FrameSource: Iterator<Item = Result<Frame, InputError>> + Send {
  fn format(&self) -> SourceFormat;

  fn pool(&self) -> &BufferPool;
}

/// 处理器忙碌时新到帧的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
  /// 忙碌时立即释放新帧，只处理最新的画面
  #[default]
  KeepLatest,
  /// 最多缓存 `depth` 帧，超出后阻塞帧源
  Queue { depth: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的背压策略: {0}")]
pub struct ParseBackpressureError(String);

impl FromStr for Backpressure {
  type Err = ParseBackpressureError;

  /// 接受 `keep-latest`、`queue` 与 `queue:<depth>`
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "keep-latest" | "latest" => Ok(Backpressure::KeepLatest),
      "queue" => Ok(Backpressure::Queue {
        depth: DEFAULT_QUEUE_DEPTH,
      }),
      other => other
        .strip_prefix("queue:")
        .and_then(|depth| depth.parse::<usize>().ok())
        .filter(|depth| *depth > 0)
        .map(|depth| Backpressure::Queue { depth })
        .ok_or_else(|| ParseBackpressureError(s.to_string())),
    }
  }
}

impl fmt::Display for Backpressure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Backpressure::KeepLatest => write!(f, "keep-latest"),
      Backpressure::Queue { depth } => write!(f, "queue:{}", depth),
    }
  }
}

/// 按固定帧率节拍产生帧序号与时间戳
#[derive(Debug)]
pub(crate) struct FramePacer {
  interval: Option<Duration>,
  started: Instant,
  next_due: Instant,
  next_index: u64,
}

impl FramePacer {
  pub(crate) fn new(fps: u32) -> Self {
    let now = Instant::now();
    Self {
      interval: (fps > 0).then(|| Duration::from_secs(1) / fps),
      started: now,
      next_due: now,
      next_index: 0,
    }
  }

  pub(crate) fn ticks(&self) -> u64 {
    self.next_index
  }

  /// 等待下一个节拍，返回 `(帧序号, 时间戳毫秒)`
  ///
  /// 落后于节拍时不补帧，从当前时刻重新计时。
  pub(crate) fn tick(&mut self) -> (u64, u64) {
    if let Some(interval) = self.interval {
      let now = Instant::now();
      if self.next_due > now {
        thread::sleep(self.next_due - now);
        self.next_due += interval;
      } else {
        self.next_due = now + interval;
      }
    }

    let index = self.next_index;
    self.next_index += 1;
    (index, self.started.elapsed().as_millis() as u64)
  }
}

/// 读取输入源 URL 中的公共参数：`rotate` 与 `pool`
pub(crate) fn common_params(url: &url::Url) -> Result<(Rotation, usize), InputError> {
  let rotation = match query_param::<u32>(url, "rotate") {
    Some(degrees) => Rotation::from_degrees(degrees)?,
    None => Rotation::default(),
  };
  let pool = query_param::<usize>(url, "pool")
    .filter(|size| *size > 0)
    .unwrap_or(DEFAULT_POOL_SIZE);
  Ok((rotation, pool))
}

pub enum InputWrapper {
  Synthetic(SyntheticCamera),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "v4l_input")]
  V4l(V4lInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() == SyntheticCamera::SCHEME {
      return Ok(InputWrapper::Synthetic(SyntheticCamera::from_url(url)?));
    }
    #[cfg(feature = "read_image_file")]
    if url.scheme() == ImageFileInput::SCHEME {
      return Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?));
    }
    #[cfg(feature = "v4l_input")]
    if url.scheme() == V4lInput::SCHEME {
      return Ok(InputWrapper::V4l(V4lInput::from_url(url)?));
    }
    Err(InputError::SchemeMismatch)
  }
}

impl Iterator for InputWrapper {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapper::Synthetic(input) => input.next(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.next(),
    }
  }
}

impl FrameSource for InputWrapper {
  fn format(&self) -> SourceFormat {
    match self {
      InputWrapper::Synthetic(input) => input.format(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.format(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.format(),
    }
  }

  fn pool(&self) -> &BufferPool {
    match self {
      InputWrapper::Synthetic(input) => input.pool(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.pool(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(input) => input.pool(),
    }
  }
}
