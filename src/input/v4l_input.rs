// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/v4l_input.rs - V4L 视频输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Instant;

use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::Capture,
};

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::{BufferPool, Frame, InputImage, Rotation},
  input::{FrameSource, InputError, SourceFormat, common_params},
  query_param,
};

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("设备不支持 YUYV 格式，实际格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("采集缓冲长度不足: 期望 {expected}, 实际 {actual}")]
  ShortBuffer { expected: usize, actual: usize },
}

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const CAPTURE_BUFFERS: u32 = 4;

/// V4L2 摄像头，以 YUYV 格式采集并转换为 RGB
///
/// `v4l:///dev/video0?width=&height=&rotate=&pool=`
pub struct V4lInput {
  stream: Stream<'static>,
  width: u32,
  height: u32,
  rotation: Rotation,
  pool: BufferPool,
  frame_index: u64,
  start_time: Instant,
}

impl FromUrlWithScheme for V4lInput {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4lInputError::SchemeMismatch.into());
    }

    let device_path = match decode_url_path(url) {
      path if path.is_empty() || path == "/" => DEFAULT_DEVICE.to_string(),
      path => path,
    };
    let (rotation, pool) = common_params(url)?;
    let width = query_param(url, "width").unwrap_or(DEFAULT_WIDTH);
    let height = query_param(url, "height").unwrap_or(DEFAULT_HEIGHT);

    Ok(Self::open(&device_path, width, height, rotation, pool)?)
  }
}

impl V4lInput {
  pub fn open(
    device_path: &str,
    width: u32,
    height: u32,
    rotation: Rotation,
    pool_size: usize,
  ) -> Result<Self, V4lInputError> {
    let device = Device::with_path(device_path)?;

    let mut format = device.format()?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(V4lInputError::UnsupportedPixelFormat(format.fourcc.to_string()));
    }
    info!(
      "已打开设备 {} ({}x{} YUYV)",
      device_path, format.width, format.height
    );

    let stream = Stream::with_buffers(&device, Type::VideoCapture, CAPTURE_BUFFERS)?;

    Ok(Self {
      stream,
      width: format.width,
      height: format.height,
      rotation,
      pool: BufferPool::new(pool_size),
      frame_index: 0,
      start_time: Instant::now(),
    })
  }

  fn capture(&mut self) -> Result<Vec<u8>, V4lInputError> {
    let (buffer, _meta) = self.stream.next()?;
    let expected = yuyv_len(self.width, self.height);
    if buffer.len() < expected {
      return Err(V4lInputError::ShortBuffer {
        expected,
        actual: buffer.len(),
      });
    }
    Ok(yuyv_to_rgb(&buffer[..expected]))
  }
}

/// YUYV 每像素 2 字节
fn yuyv_len(width: u32, height: u32) -> usize {
  2 * width as usize * height as usize
}

/// YUYV 4:2:2 转 RGB24，每 4 字节产生两个像素
pub fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
  let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    for y in [chunk[0] as f32, chunk[2] as f32] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Iterator for V4lInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    // 设备节拍即采集节奏；没有缓冲时仍然取走这一帧，避免驱动队列积压
    let data = self.capture();
    let index = self.frame_index;
    self.frame_index += 1;
    let timestamp_ms = self.start_time.elapsed().as_millis() as u64;

    let Some(lease) = self.pool.try_acquire() else {
      return Some(Err(InputError::PoolExhausted));
    };

    let frame = match data {
      Ok(data) => InputImage::from_rgb(self.width, self.height, data, self.rotation)
        .map(|image| Frame::new(image, index, timestamp_ms, lease))
        .map_err(InputError::from),
      Err(e) => {
        error!("无法采集第 {} 帧: {}", index, e);
        Err(e.into())
      }
    };
    Some(frame)
  }
}

impl FrameSource for V4lInput {
  fn format(&self) -> SourceFormat {
    SourceFormat {
      width: self.width,
      height: self.height,
      fps: 0,
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
  fn yuyv_grey_maps_to_grey() {
    let rgb = yuyv_to_rgb(&[128, 128, 64, 128]);
    assert_eq!(rgb, vec![128, 128, 128, 64, 64, 64]);
  }

  #[test]
  #[cfg(target_pointer_width = "64")]
  fn yuyv_len_does_not_wrap_for_large_sizes() {
    assert_eq!(yuyv_len(70_000, 70_000), 9_800_000_000);
  }

  #[test]
  fn yuyv_ignores_trailing_bytes() {
    assert_eq!(yuyv_to_rgb(&[0, 128, 0, 128, 9, 9]).len(), 6);
  }
}
