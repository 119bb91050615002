// 该文件是 Kanjian （看见） 项目的一部分。
// src/task.rs - 流水线任务
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
  collections::VecDeque,
  sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  input::{Backpressure, InputError},
  model::{Abandoned, Completion},
  processor::{Detector, FrameOutcome, SubmitError, VisionProcessor},
};

/// 等待在途请求完成的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("没有输入帧")]
  NoFrame,
  #[error("输入错误: {0}")]
  InputError(#[from] InputError),
  #[error("提交被拒绝: {0}")]
  Rejected(SubmitError),
  #[error("{0}")]
  Abandoned(#[from] Abandoned),
  #[error("无法安装中断处理器: {0}")]
  InterruptHandler(#[from] ctrlc::Error),
}

pub trait Task<S, D: Detector>: Sized {
  type Output;

  fn run_task(self, source: S, processor: &VisionProcessor<D>) -> Result<Self::Output, TaskError>;
}

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// 安装 Ctrl-C 处理器，返回共享的退出标志
///
/// 收到信号后置位标志；30 秒内仍未退出则强制结束进程。重复调用返回同一个标志。
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>, TaskError> {
  if let Some(flag) = SHUTDOWN.get() {
    return Ok(flag.clone());
  }

  let flag = Arc::new(AtomicBool::new(false));
  let handler_flag = flag.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    handler_flag.store(true, Ordering::Release);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  Ok(SHUTDOWN.get_or_init(|| flag).clone())
}

/// 取一帧，提交，并等待其结果
pub struct OneShotTask;

impl<S, D> Task<S, D> for OneShotTask
where
  S: Iterator<Item = Result<Frame, InputError>>,
  D: Detector,
{
  type Output = FrameOutcome;

  fn run_task(
    self,
    mut source: S,
    processor: &VisionProcessor<D>,
  ) -> Result<FrameOutcome, TaskError> {
    info!("开始任务...");
    let frame = source.next().ok_or(TaskError::NoFrame)??;
    info!("输入帧获取成功，开始推理...");

    let now = Instant::now();
    let completion = processor
      .submit(frame)
      .map_err(|rejected| TaskError::Rejected(rejected.reason))?;
    let outcome = completion.wait()?;
    info!("推理完成，耗时: {:.2?}, 结果: {:?}", now.elapsed(), outcome);

    Ok(outcome)
  }
}

/// 流式任务统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
  /// 帧源采样次数
  pub ticks: u64,
  /// 提交给处理器的帧数
  pub submitted: u64,
  /// 处理器忙碌而被释放的帧数
  pub dropped: u64,
  /// 缓冲池耗尽而没有帧的采样次数
  pub starved: u64,
  /// 引擎拒绝受理的帧数
  pub rejected: u64,
}

/// 持续从帧源取帧并按背压策略提交
#[derive(Default, Debug)]
pub struct StreamTask {
  frame_number: Option<u64>,
  backpressure: Backpressure,
  shutdown: Option<Arc<AtomicBool>>,
}

impl StreamTask {
  /// 采样达到指定次数后退出
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
    self.backpressure = backpressure;
    self
  }

  pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
    self.shutdown = Some(shutdown);
    self
  }

  fn should_stop(&self, stats: &StreamStats) -> bool {
    if self.frame_number.is_some_and(|n| stats.ticks >= n) {
      info!("达到指定帧数 {}, 退出任务循环", stats.ticks);
      return true;
    }
    if self
      .shutdown
      .as_ref()
      .is_some_and(|flag| flag.load(Ordering::Acquire))
    {
      warn!("中断信号接收，退出任务循环");
      return true;
    }
    false
  }
}

/// 流式任务内部状态：在途请求与等待队列
struct Driver<'a, D: Detector> {
  processor: &'a VisionProcessor<D>,
  in_flight: Option<Completion<FrameOutcome>>,
  queue: VecDeque<Frame>,
  stats: StreamStats,
  closed: bool,
}

impl<D: Detector> Driver<'_, D> {
  /// 提交一帧；返回被拒绝的帧以便调用方决定去留
  fn offer(&mut self, frame: Frame) -> Option<Frame> {
    match self.processor.submit(frame) {
      Ok(completion) => {
        self.stats.submitted += 1;
        self.in_flight = Some(completion);
        None
      }
      Err(rejected) => match rejected.reason {
        SubmitError::Busy => Some(rejected.frame),
        SubmitError::AdapterClosed => {
          self.closed = true;
          rejected.frame.release();
          None
        }
        SubmitError::EngineUnavailable(error) => {
          warn!("第 {} 帧被引擎拒绝: {}", rejected.frame.meta().index, error);
          self.stats.rejected += 1;
          rejected.frame.release();
          None
        }
      },
    }
  }

  fn keep_latest(&mut self, frame: Frame) {
    if let Some(frame) = self.offer(frame) {
      debug!("处理器忙碌，丢弃第 {} 帧", frame.meta().index);
      self.stats.dropped += 1;
      frame.release();
    }
  }

  /// 尽可能把队首帧交给处理器
  fn pump(&mut self) {
    while !self.closed {
      let Some(frame) = self.queue.pop_front() else {
        return;
      };
      if let Some(frame) = self.offer(frame) {
        self.queue.push_front(frame);
        return;
      }
    }
  }

  /// 等待在途请求完成；超时返回 `false`
  fn wait_in_flight(&mut self) -> bool {
    let Some(completion) = self.in_flight.take() else {
      return true;
    };
    match completion.wait_timeout(DRAIN_TIMEOUT) {
      Ok(outcome) => {
        debug!("在途请求完成: {:?}", outcome);
        true
      }
      Err(completion) => {
        warn!("等待在途请求超时");
        self.in_flight = Some(completion);
        false
      }
    }
  }

  fn enqueue(&mut self, frame: Frame, depth: usize) {
    self.queue.push_back(frame);
    self.pump();
    // 队列已满时阻塞帧源
    while self.queue.len() > depth && !self.closed {
      if !self.wait_in_flight() {
        break;
      }
      self.pump();
    }
  }

  fn drain(&mut self) {
    while !self.queue.is_empty() && !self.closed {
      if !self.wait_in_flight() {
        break;
      }
      self.pump();
    }
    if !self.queue.is_empty() {
      debug!("释放 {} 个未处理的排队帧", self.queue.len());
      self.queue.clear();
    }
    self.wait_in_flight();
  }
}

impl<S, D> Task<S, D> for StreamTask
where
  S: Iterator<Item = Result<Frame, InputError>>,
  D: Detector,
{
  type Output = StreamStats;

  fn run_task(self, source: S, processor: &VisionProcessor<D>) -> Result<StreamStats, TaskError> {
    info!("开始任务，背压策略: {}", self.backpressure);
    let started = Instant::now();
    let mut driver = Driver {
      processor,
      in_flight: None,
      queue: VecDeque::new(),
      stats: StreamStats::default(),
      closed: false,
    };

    for next in source {
      driver.stats.ticks += 1;
      match next {
        Ok(frame) => match self.backpressure {
          Backpressure::KeepLatest => driver.keep_latest(frame),
          Backpressure::Queue { depth } => driver.enqueue(frame, depth),
        },
        Err(InputError::PoolExhausted) => {
          debug!("缓冲池耗尽，跳过本次采样");
          driver.stats.starved += 1;
        }
        Err(e) => {
          driver.drain();
          return Err(e.into());
        }
      }
      // 在途请求可能已在两次采样之间完成，队首帧不必等到下一帧到达
      driver.pump();

      if driver.closed {
        warn!("处理器已关闭，退出任务循环");
        break;
      }
      if self.should_stop(&driver.stats) {
        break;
      }
    }

    driver.drain();
    let stats = driver.stats;
    info!(
      "任务完成，耗时 {:.2?}: 采样 {} 次, 提交 {} 帧, 丢弃 {} 帧, 缺少缓冲 {} 次, 引擎拒绝 {} 帧",
      started.elapsed(),
      stats.ticks,
      stats.submitted,
      stats.dropped,
      stats.starved,
      stats.rejected
    );
    Ok(stats)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{BufferPool, InputImage, Rotation};
  use crate::input::{FrameSource, SyntheticCamera};
  use crate::model::{BoundingBox, DetectedObject, Label, ModelEngine, ReplayModel};
  use crate::output::{ErrorSink, ResultSink};
  use crate::processor::ObjectDetectorProcessor;
  use crate::{frame::FrameMeta, model::DetectionResult, model::InferenceError};
  use std::sync::atomic::AtomicU64;

  type Processor = VisionProcessor<ObjectDetectorProcessor<ModelEngine>>;

  fn processor(latency: Duration) -> (Processor, Arc<AtomicU64>) {
    let model = ReplayModel::from_records(vec![vec![DetectedObject::new(
      BoundingBox::new(10.0, 10.0, 50.0, 50.0),
      vec![Label::new("cup", 0.92, 41)],
    )]])
    .unwrap()
    .with_latency(latency);
    let engine = ModelEngine::spawn(model, Duration::from_secs(5)).unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    let results: Arc<dyn ResultSink> = Arc::new(move |_: &FrameMeta, _: &DetectionResult| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    let errors: Arc<dyn ErrorSink> = Arc::new(|_: &FrameMeta, _: &InferenceError| {});
    (
      VisionProcessor::new(ObjectDetectorProcessor::new(engine), results, errors),
      delivered,
    )
  }

  #[test]
  fn keep_latest_accounts_for_every_tick() {
    let (processor, delivered) = processor(Duration::from_millis(20));
    let camera = SyntheticCamera::new(8, 8, 200)
      .with_pool_size(4)
      .with_frame_limit(Some(40));
    let pool = camera.pool().clone();

    let stats = StreamTask::default().run_task(camera, &processor).unwrap();
    assert_eq!(stats.ticks, 40);
    assert_eq!(
      stats.ticks,
      stats.submitted + stats.dropped + stats.starved + stats.rejected
    );
    assert!(stats.submitted >= 1);
    assert!(stats.dropped >= 1);
    assert_eq!(delivered.load(Ordering::SeqCst), stats.submitted);
    assert_eq!(pool.stats().outstanding, 0);
    processor.close();
  }

  #[test]
  fn queue_mode_submits_every_frame() {
    let (processor, delivered) = processor(Duration::from_millis(2));
    let camera = SyntheticCamera::new(8, 8, 0)
      .with_pool_size(4)
      .with_frame_limit(Some(6));
    let pool = camera.pool().clone();

    let stats = StreamTask::default()
      .with_backpressure(Backpressure::Queue { depth: 2 })
      .run_task(camera, &processor)
      .unwrap();
    assert_eq!(stats.submitted, 6);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.starved, 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 6);
    assert_eq!(pool.stats().outstanding, 0);
  }

  #[test]
  fn queued_frame_advances_on_starved_ticks() {
    let (processor, delivered) = processor(Duration::from_millis(20));
    let pool = BufferPool::new(4);
    let image = InputImage::from_rgb(2, 2, vec![0; 12], Rotation::Deg0).unwrap();
    let mut frames: VecDeque<Frame> = (0..2)
      .map(|i| Frame::new(image.clone(), i, i * 10, pool.try_acquire().unwrap()))
      .collect();

    // 两帧之后帧源只剩缺少缓冲的采样，结束时记下已交付的帧数
    let observed = Arc::new(AtomicU64::new(0));
    let seen = observed.clone();
    let counter = delivered.clone();
    let mut idle = 20;
    let source = std::iter::from_fn(move || {
      if let Some(frame) = frames.pop_front() {
        return Some(Ok(frame));
      }
      if idle == 0 {
        seen.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
        return None;
      }
      idle -= 1;
      std::thread::sleep(Duration::from_millis(10));
      Some(Err(InputError::PoolExhausted))
    });

    let stats = StreamTask::default()
      .with_backpressure(Backpressure::Queue { depth: 2 })
      .run_task(source, &processor)
      .unwrap();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.starved, 20);
    assert_eq!(observed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().outstanding, 0);
  }

  #[test]
  fn frame_number_and_shutdown_stop_the_loop() {
    let (processor, _) = processor(Duration::ZERO);
    let camera = SyntheticCamera::new(4, 4, 0);
    let stats = StreamTask::default()
      .with_frame_number(Some(5))
      .run_task(camera, &processor)
      .unwrap();
    assert_eq!(stats.ticks, 5);

    let shutdown = Arc::new(AtomicBool::new(true));
    let camera = SyntheticCamera::new(4, 4, 0);
    let stats = StreamTask::default()
      .with_shutdown(shutdown)
      .run_task(camera, &processor)
      .unwrap();
    assert_eq!(stats.ticks, 1);
  }

  #[test]
  fn closed_processor_ends_stream() {
    let (processor, _) = processor(Duration::ZERO);
    processor.close();
    let camera = SyntheticCamera::new(4, 4, 0);
    let pool = camera.pool().clone();
    let stats = StreamTask::default().run_task(camera, &processor).unwrap();
    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.submitted, 0);
    assert_eq!(pool.stats().outstanding, 0);
  }

  #[test]
  fn one_shot_waits_for_outcome() {
    let (processor, delivered) = processor(Duration::from_millis(5));
    let pool = BufferPool::new(1);
    let frame = Frame::new(
      InputImage::from_rgb(2, 2, vec![0; 12], Rotation::Deg0).unwrap(),
      0,
      0,
      pool.try_acquire().unwrap(),
    );

    let outcome = OneShotTask
      .run_task(std::iter::once(Ok(frame)), &processor)
      .unwrap();
    assert_eq!(outcome, FrameOutcome::Delivered);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().outstanding, 0);

    let empty = std::iter::empty::<Result<Frame, InputError>>();
    assert!(matches!(
      OneShotTask.run_task(empty, &processor),
      Err(TaskError::NoFrame)
    ));
  }
}
