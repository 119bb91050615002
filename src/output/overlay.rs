// 该文件是 Kanjian （看见） 项目的一部分。
// src/output/overlay.rs - 检测结果叠加层
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # 叠加层
//!
//! [`GraphicOverlay`] 保存当前帧的图形集合。每次交付结果时先清空，
//! 再为每个检测对象添加一个 [`ObjectGraphic`]，最后请求重绘。
//!
//! 重绘由独立的渲染线程完成，请求通道容量为 1：渲染线程忙碌时新的请求被跳过，
//! 交付路径永远不会阻塞。

use std::{
  fmt::Display,
  sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
    mpsc::{self, SyncSender, TrySendError},
  },
  thread::{self, JoinHandle},
};

use tracing::{debug, error};

use crate::{
  frame::FrameMeta,
  model::{DetectedObject, DetectionResult},
  output::ResultSink,
};

const PALETTE_SIZE: usize = 80;

/// 叠加层上的一个检测对象
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectGraphic {
  pub object: DetectedObject,
  pub color: [u8; 3],
}

impl ObjectGraphic {
  /// 颜色优先按跟踪编号选取，其次按首个标签的类别编号
  pub fn new(object: DetectedObject) -> Self {
    let key = object
      .tracking_id
      .map(|id| id as usize)
      .or_else(|| object.top_label().map(|label| label.index as usize))
      .unwrap_or(0);
    Self {
      color: palette_color(key),
      object,
    }
  }
}

/// 渲染线程拿到的一次重绘内容
#[derive(Debug, Clone)]
pub struct OverlaySnapshot {
  pub frame: FrameMeta,
  pub graphics: Vec<ObjectGraphic>,
}

pub trait OverlayRenderer: Send + 'static {
  type Error: Display;

  fn draw(&mut self, snapshot: &OverlaySnapshot) -> Result<(), Self::Error>;
}

#[derive(Default)]
struct OverlayState {
  frame: Option<FrameMeta>,
  graphics: Vec<ObjectGraphic>,
}

#[derive(Default)]
pub struct GraphicOverlay {
  state: Mutex<OverlayState>,
  redraw: Mutex<Option<SyncSender<OverlaySnapshot>>>,
  renderer: Mutex<Option<JoinHandle<()>>>,
  posted: AtomicU64,
  skipped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GraphicOverlay {
  /// 没有渲染线程的叠加层，只维护图形集合
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_renderer<R: OverlayRenderer>(mut renderer: R) -> std::io::Result<Self> {
    let (tx, rx) = mpsc::sync_channel::<OverlaySnapshot>(1);
    let handle = thread::Builder::new()
      .name("kanjian-overlay".to_string())
      .spawn(move || {
        for snapshot in rx {
          if let Err(e) = renderer.draw(&snapshot) {
            error!("第 {} 帧叠加层渲染失败: {}", snapshot.frame.index, e);
          }
        }
        debug!("渲染线程退出");
      })?;

    Ok(Self {
      state: Mutex::new(OverlayState::default()),
      redraw: Mutex::new(Some(tx)),
      renderer: Mutex::new(Some(handle)),
      posted: AtomicU64::new(0),
      skipped: AtomicU64::new(0),
    })
  }

  pub fn set_image_source_info(&self, meta: FrameMeta) {
    lock(&self.state).frame = Some(meta);
  }

  pub fn add(&self, graphic: ObjectGraphic) {
    lock(&self.state).graphics.push(graphic);
  }

  pub fn clear(&self) {
    lock(&self.state).graphics.clear();
  }

  pub fn graphics(&self) -> Vec<ObjectGraphic> {
    lock(&self.state).graphics.clone()
  }

  /// 请求重绘，返回请求是否被渲染线程接收
  pub fn post_invalidate(&self) -> bool {
    let snapshot = {
      let state = lock(&self.state);
      let Some(frame) = state.frame else {
        return false;
      };
      OverlaySnapshot {
        frame,
        graphics: state.graphics.clone(),
      }
    };

    let redraw = lock(&self.redraw);
    let Some(tx) = redraw.as_ref() else {
      return false;
    };
    match tx.try_send(snapshot) {
      Ok(()) => {
        self.posted.fetch_add(1, Ordering::Relaxed);
        true
      }
      Err(TrySendError::Full(snapshot)) => {
        debug!("渲染线程忙碌，跳过第 {} 帧的重绘", snapshot.frame.index);
        self.skipped.fetch_add(1, Ordering::Relaxed);
        false
      }
      Err(TrySendError::Disconnected(_)) => false,
    }
  }

  /// 已提交与被跳过的重绘次数
  pub fn redraw_stats(&self) -> (u64, u64) {
    (
      self.posted.load(Ordering::Relaxed),
      self.skipped.load(Ordering::Relaxed),
    )
  }

  /// 停止接收重绘请求，并等待渲染线程处理完已排队的请求
  pub fn finish(&self) {
    lock(&self.redraw).take();
    if let Some(handle) = lock(&self.renderer).take() {
      if handle.join().is_err() {
        error!("渲染线程异常退出");
      }
    }
  }
}

impl Drop for GraphicOverlay {
  fn drop(&mut self) {
    self.finish();
  }
}

impl ResultSink for GraphicOverlay {
  fn deliver(&self, meta: &FrameMeta, result: &DetectionResult) {
    self.clear();
    self.set_image_source_info(*meta);
    for object in &result.objects {
      self.add(ObjectGraphic::new(object.clone()));
    }
    self.post_invalidate();
  }
}

pub(crate) fn palette_color(key: usize) -> [u8; 3] {
  let hue = ((key % PALETTE_SIZE) as f32 / PALETTE_SIZE as f32) * 360.0;
  hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  [
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ]
}
