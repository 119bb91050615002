// 该文件是 Kanjian （看见） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode_url_path,
  frame::{BufferPool, Frame, FrameError, InputImage, Rotation},
  input::{FramePacer, FrameSource, InputError, SourceFormat, common_params},
  query_param,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 把一张静态图片当作摄像头画面重复输出
///
/// `image:///path.png?fps=&repeat=&rotate=&pool=`。`repeat` 缺省为 1，
/// `repeat=0` 表示无限重复；`fps` 缺省为 0（不限速）。
#[derive(Debug)]
pub struct ImageFileInput {
  image: InputImage,
  fps: u32,
  repeat: Option<u64>,
  pool: BufferPool,
  pacer: FramePacer,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch.into());
    }

    let (rotation, pool) = common_params(url)?;
    let path = decode_url_path(url);
    let image = ImageReader::open(&path)
      .map_err(ImageFileInputError::from)?
      .decode()
      .map_err(ImageFileInputError::from)?;
    info!("已加载图像 {} ({}x{})", path, image.width(), image.height());

    let fps = query_param(url, "fps").unwrap_or(0);
    let repeat = match query_param::<u64>(url, "repeat") {
      Some(0) => None,
      Some(n) => Some(n),
      None => Some(1),
    };

    Ok(Self::from_rgb_image(image.into(), rotation)?
      .with_fps(fps)
      .with_repeat(repeat)
      .with_pool_size(pool))
  }
}

impl ImageFileInput {
  pub fn from_rgb_image(image: RgbImage, rotation: Rotation) -> Result<Self, FrameError> {
    let (width, height) = image.dimensions();
    let image = InputImage::from_rgb(width, height, image.into_raw(), rotation)?;
    Ok(Self {
      image,
      fps: 0,
      repeat: Some(1),
      pool: BufferPool::new(super::DEFAULT_POOL_SIZE),
      pacer: FramePacer::new(0),
    })
  }

  pub fn with_fps(mut self, fps: u32) -> Self {
    self.fps = fps;
    self.pacer = FramePacer::new(fps);
    self
  }

  /// `None` 表示无限重复
  pub fn with_repeat(mut self, repeat: Option<u64>) -> Self {
    self.repeat = repeat;
    self
  }

  pub fn with_pool_size(mut self, size: usize) -> Self {
    self.pool = BufferPool::new(size);
    self
  }
}

impl Iterator for ImageFileInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.repeat.is_some_and(|limit| self.pacer.ticks() >= limit) {
      return None;
    }

    let (index, timestamp_ms) = self.pacer.tick();
    let Some(lease) = self.pool.try_acquire() else {
      return Some(Err(InputError::PoolExhausted));
    };
    // 像素数据共享，不复制
    Some(Ok(Frame::new(
      self.image.clone(),
      index,
      timestamp_ms,
      lease,
    )))
  }
}

impl FrameSource for ImageFileInput {
  fn format(&self) -> SourceFormat {
    SourceFormat {
      width: self.image.width(),
      height: self.image.height(),
      fps: self.fps,
    }
  }

  fn pool(&self) -> &BufferPool {
    &self.pool
  }
}
