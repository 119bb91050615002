// 该文件是 Kanjian （看见） 项目的一部分。
// src/processor.rs - 视觉处理器（推理适配层）
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

//! # 视觉处理器
//!
//! [`VisionProcessor`] 把一帧画面交给 [`Detector`]，并在完成时：
//!
//! 1. 将结果交给 [`ResultSink`]，或将错误分类交给 [`ErrorSink`]；
//! 2. 归还该帧的缓冲槽位；
//! 3. 回到空闲状态，接受下一帧。
//!
//! 同一处理器同时最多只有一个推理请求。状态机：
//!
//! ```text
//! Idle --submit--> InFlight --完成(成功/失败/放弃)--> Idle
//!  \                  \
//!   \--close-->  Closed <--close--/
//! ```
//!
//! 缓冲槽位租约被移动进完成回调中，回调执行或被丢弃时都会归还，
//! 因此每一帧在任何完成路径上都恰好归还一次。

use std::sync::{
  Arc, Mutex, PoisonError,
  atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{Frame, FrameMeta, InputImage},
  model::{Abandoned, Completion, InferenceError, completion},
  output::{ErrorSink, ResultSink},
};

mod object_detector;
pub use self::object_detector::ObjectDetectorProcessor;

/// 检测器能力集合：发起检测、处理成功、处理失败、停止
pub trait Detector: Send + Sync + 'static {
  type Output: Send + 'static;

  fn detect_in_image(
    &self,
    image: InputImage,
  ) -> Result<Completion<Result<Self::Output, InferenceError>>, InferenceError>;

  fn on_success(&self, output: Self::Output, meta: &FrameMeta, sink: &dyn ResultSink);

  fn on_failure(&self, error: &InferenceError, meta: &FrameMeta, sink: &dyn ErrorSink);

  fn stop(&self);
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
  #[error("处理器已关闭")]
  AdapterClosed,
  #[error("已有推理请求在处理中")]
  Busy,
  #[error("推理引擎不可用: {0}")]
  EngineUnavailable(InferenceError),
}

/// 被拒绝的提交，帧原样交还调用方
#[derive(Error, Debug)]
#[error("提交被拒绝: {reason}")]
pub struct Rejected {
  pub reason: SubmitError,
  pub frame: Frame,
}

impl Rejected {
  pub fn into_frame(self) -> Frame {
    self.frame
  }
}

/// 一帧的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
  /// 结果已交给结果输出
  Delivered,
  /// 推理失败，错误已交给错误输出
  Failed(InferenceError),
  /// 处理器已关闭，结果被丢弃
  Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
  Idle,
  InFlight,
  Closed,
}

const IDLE: u8 = 0;
const IN_FLIGHT: u8 = 1;
const CLOSED: u8 = 2;

impl ProcessorState {
  fn from_raw(raw: u8) -> Self {
    match raw {
      IDLE => ProcessorState::Idle,
      IN_FLIGHT => ProcessorState::InFlight,
      _ => ProcessorState::Closed,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
  pub delivered: u64,
  pub failed: u64,
  pub discarded: u64,
}

struct Inner<D: Detector> {
  detector: D,
  state: AtomicU8,
  // 结果交付与关闭互斥：close 返回后不会再有结果交给输出
  delivery: Mutex<()>,
  stopped: AtomicBool,
  results: Arc<dyn ResultSink>,
  errors: Arc<dyn ErrorSink>,
  delivered: AtomicU64,
  failed: AtomicU64,
  discarded: AtomicU64,
}

impl<D: Detector> Inner<D> {
  fn finish(
    &self,
    result: Result<Result<D::Output, InferenceError>, Abandoned>,
    meta: &FrameMeta,
  ) -> FrameOutcome {
    let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
    if self.state.load(Ordering::Acquire) == CLOSED {
      self.discarded.fetch_add(1, Ordering::Relaxed);
      debug!("处理器已关闭，丢弃第 {} 帧的结果", meta.index);
      return FrameOutcome::Discarded;
    }

    match result.map_err(InferenceError::from).and_then(|r| r) {
      Ok(output) => {
        self.detector.on_success(output, meta, self.results.as_ref());
        self.delivered.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Delivered
      }
      Err(error) => {
        self.detector.on_failure(&error, meta, self.errors.as_ref());
        self.failed.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Failed(error)
      }
    }
  }

  fn stop_detector(&self) {
    if !self.stopped.swap(true, Ordering::AcqRel) {
      self.detector.stop();
    }
  }
}

impl<D: Detector> Drop for Inner<D> {
  fn drop(&mut self) {
    self.stop_detector();
  }
}

/// 在途标记，丢弃时把状态从 InFlight 恢复为 Idle（已关闭则保持关闭）
struct InFlightGuard<D: Detector> {
  inner: Arc<Inner<D>>,
}

impl<D: Detector> Drop for InFlightGuard<D> {
  fn drop(&mut self) {
    let _ = self.inner.state.compare_exchange(
      IN_FLIGHT,
      IDLE,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
  }
}

/// 视觉处理器：一个检测器实例加上结果输出与错误输出
pub struct VisionProcessor<D: Detector> {
  inner: Arc<Inner<D>>,
}

impl<D: Detector> Clone for VisionProcessor<D> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<D: Detector> VisionProcessor<D> {
  pub fn new(detector: D, results: Arc<dyn ResultSink>, errors: Arc<dyn ErrorSink>) -> Self {
    Self {
      inner: Arc::new(Inner {
        detector,
        state: AtomicU8::new(IDLE),
        delivery: Mutex::new(()),
        stopped: AtomicBool::new(false),
        results,
        errors,
        delivered: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        discarded: AtomicU64::new(0),
      }),
    }
  }

  pub fn state(&self) -> ProcessorState {
    ProcessorState::from_raw(self.inner.state.load(Ordering::Acquire))
  }

  pub fn is_idle(&self) -> bool {
    self.state() == ProcessorState::Idle
  }

  pub fn stats(&self) -> ProcessorStats {
    ProcessorStats {
      delivered: self.inner.delivered.load(Ordering::Relaxed),
      failed: self.inner.failed.load(Ordering::Relaxed),
      discarded: self.inner.discarded.load(Ordering::Relaxed),
    }
  }

  /// 提交一帧进行检测
  ///
  /// 立即返回，不等待推理。处理器忙碌、已关闭或引擎拒绝受理时，
  /// 帧通过 [`Rejected`] 原样交还，缓冲槽位仍归调用方所有。
  pub fn submit(&self, frame: Frame) -> Result<Completion<FrameOutcome>, Rejected> {
    if let Err(current) =
      self
        .inner
        .state
        .compare_exchange(IDLE, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
    {
      let reason = if current == CLOSED {
        SubmitError::AdapterClosed
      } else {
        SubmitError::Busy
      };
      debug!("第 {} 帧提交被拒绝: {}", frame.meta().index, reason);
      return Err(Rejected { reason, frame });
    }

    let (image, meta, lease) = frame.into_parts();
    let guard = InFlightGuard {
      inner: self.inner.clone(),
    };

    let pending = match self.inner.detector.detect_in_image(image.clone()) {
      Ok(pending) => pending,
      Err(error) => {
        drop(guard);
        warn!("第 {} 帧无法提交: {}", meta.index, error);
        return Err(Rejected {
          reason: SubmitError::EngineUnavailable(error),
          frame: Frame::from_parts(image, meta, lease),
        });
      }
    };
    drop(image);
    debug!("第 {} 帧已提交", meta.index);

    let (done, outcome) = completion::channel();
    let inner = self.inner.clone();
    pending.on_complete(move |result| {
      let outcome = inner.finish(result, &meta);
      lease.release();
      drop(guard);
      done.resolve(outcome);
    });

    Ok(outcome)
  }

  /// 关闭处理器并停止检测器，可重复调用
  ///
  /// 不等待在途请求；其结果到达时被丢弃，缓冲槽位照常归还。
  /// 若某个结果正在交付，等待该次交付结束后才返回，因此不能在输出回调中调用。
  pub fn close(&self) {
    let previous = {
      let _delivery = self
        .inner
        .delivery
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      self.inner.state.swap(CLOSED, Ordering::AcqRel)
    };
    match previous {
      CLOSED => return,
      IN_FLIGHT => info!("关闭处理器，在途请求的结果将被丢弃"),
      _ => info!("关闭处理器"),
    }
    self.inner.stop_detector();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{BufferPool, Rotation};
  use crate::model::{DetectionResult, Resolver};
  use std::sync::atomic::AtomicUsize;
  use std::sync::mpsc;
  use std::thread;
  use std::time::Duration;

  type Reply = Resolver<Result<u32, InferenceError>>;

  /// 由测试手动完成请求的检测器
  #[derive(Default)]
  struct ManualDetector {
    pending: Mutex<Vec<Reply>>,
    calls: AtomicUsize,
    stops: AtomicUsize,
    refuse: AtomicBool,
  }

  impl ManualDetector {
    fn take(&self) -> Reply {
      self.pending.lock().unwrap().remove(0)
    }
  }

  impl Detector for Arc<ManualDetector> {
    type Output = u32;

    fn detect_in_image(
      &self,
      _image: InputImage,
    ) -> Result<Completion<Result<u32, InferenceError>>, InferenceError> {
      if self.refuse.load(Ordering::SeqCst) {
        return Err(InferenceError::EngineUnavailable("未初始化".to_string()));
      }
      self.calls.fetch_add(1, Ordering::SeqCst);
      let (resolver, completion) = completion::channel();
      self.pending.lock().unwrap().push(resolver);
      Ok(completion)
    }

    fn on_success(&self, output: u32, meta: &FrameMeta, sink: &dyn ResultSink) {
      let result = DetectionResult {
        frame_index: meta.index,
        objects: Vec::new(),
      };
      assert_eq!(output, 1);
      sink.deliver(meta, &result);
    }

    fn on_failure(&self, error: &InferenceError, meta: &FrameMeta, sink: &dyn ErrorSink) {
      sink.report(meta, error);
    }

    fn stop(&self) {
      self.stops.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct Harness {
    detector: Arc<ManualDetector>,
    processor: VisionProcessor<Arc<ManualDetector>>,
    pool: BufferPool,
    delivered: Arc<Mutex<Vec<u64>>>,
    reported: Arc<Mutex<Vec<InferenceError>>>,
  }

  fn harness() -> Harness {
    let detector = Arc::new(ManualDetector::default());
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let reported = Arc::new(Mutex::new(Vec::new()));
    let results = {
      let delivered = delivered.clone();
      move |meta: &FrameMeta, _: &DetectionResult| delivered.lock().unwrap().push(meta.index)
    };
    let errors = {
      let reported = reported.clone();
      move |_: &FrameMeta, error: &InferenceError| reported.lock().unwrap().push(error.clone())
    };
    let processor = VisionProcessor::new(detector.clone(), Arc::new(results), Arc::new(errors));
    Harness {
      detector,
      processor,
      pool: BufferPool::new(4),
      delivered,
      reported,
    }
  }

  fn frame(pool: &BufferPool, index: u64) -> Frame {
    let image = InputImage::from_rgb(2, 2, vec![0; 12], Rotation::Deg0).unwrap();
    Frame::new(image, index, index * 33, pool.try_acquire().unwrap())
  }

  fn settle(outcome: Completion<FrameOutcome>) -> FrameOutcome {
    outcome
      .wait_timeout(Duration::from_secs(5))
      .ok()
      .expect("completion never fired")
      .expect("completion abandoned")
  }

  #[test]
  fn success_path_releases_once_and_returns_to_idle() {
    let h = harness();
    let outcome = h.processor.submit(frame(&h.pool, 1)).unwrap();
    assert_eq!(h.processor.state(), ProcessorState::InFlight);
    assert_eq!(h.pool.stats().outstanding, 1);

    h.detector.take().resolve(Ok(1));
    assert_eq!(settle(outcome), FrameOutcome::Delivered);
    assert_eq!(h.processor.state(), ProcessorState::Idle);
    assert_eq!(h.pool.stats().released, 1);
    assert_eq!(h.pool.stats().outstanding, 0);
    assert_eq!(*h.delivered.lock().unwrap(), vec![1]);
  }

  #[test]
  fn failure_path_reports_and_releases() {
    let h = harness();
    let outcome = h.processor.submit(frame(&h.pool, 1)).unwrap();
    h.detector
      .take()
      .resolve(Err(InferenceError::MalformedInput("坏帧".to_string())));

    assert!(matches!(
      settle(outcome),
      FrameOutcome::Failed(InferenceError::MalformedInput(_))
    ));
    assert_eq!(h.reported.lock().unwrap().len(), 1);
    assert_eq!(h.pool.stats().released, 1);
    assert!(h.processor.is_idle());
    assert_eq!(h.processor.stats().failed, 1);
  }

  #[test]
  fn abandoned_request_counts_as_engine_unavailable() {
    let h = harness();
    let outcome = h.processor.submit(frame(&h.pool, 1)).unwrap();
    drop(h.detector.take());

    assert!(matches!(
      settle(outcome),
      FrameOutcome::Failed(InferenceError::EngineUnavailable(_))
    ));
    assert_eq!(h.pool.stats().released, 1);
  }

  #[test]
  fn busy_processor_hands_frame_back() {
    let h = harness();
    let _first = h.processor.submit(frame(&h.pool, 1)).unwrap();
    let rejected = h.processor.submit(frame(&h.pool, 2)).unwrap_err();

    assert_eq!(rejected.reason, SubmitError::Busy);
    assert_eq!(rejected.frame.meta().index, 2);
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.pool.stats().outstanding, 2);
    drop(rejected);
    assert_eq!(h.pool.stats().outstanding, 1);
  }

  #[test]
  fn refused_submission_stays_idle() {
    let h = harness();
    h.detector.refuse.store(true, Ordering::SeqCst);
    let rejected = h.processor.submit(frame(&h.pool, 1)).unwrap_err();

    assert!(matches!(rejected.reason, SubmitError::EngineUnavailable(_)));
    assert!(h.processor.is_idle());
    assert_eq!(h.pool.stats().released, 0);
    rejected.into_frame().release();
    assert_eq!(h.pool.stats().released, 1);
  }

  #[test]
  fn close_is_idempotent_and_rejects_submissions() {
    let h = harness();
    h.processor.close();
    h.processor.close();
    assert_eq!(h.detector.stops.load(Ordering::SeqCst), 1);
    assert_eq!(h.processor.state(), ProcessorState::Closed);

    let rejected = h.processor.submit(frame(&h.pool, 1)).unwrap_err();
    assert_eq!(rejected.reason, SubmitError::AdapterClosed);
    assert_eq!(h.pool.stats().released, 0);
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn close_mid_flight_discards_result_but_releases() {
    let h = harness();
    let outcome = h.processor.submit(frame(&h.pool, 1)).unwrap();
    h.processor.close();
    h.detector.take().resolve(Ok(1));

    assert_eq!(settle(outcome), FrameOutcome::Discarded);
    assert_eq!(h.processor.state(), ProcessorState::Closed);
    assert!(h.delivered.lock().unwrap().is_empty());
    assert_eq!(h.pool.stats().released, 1);
    assert_eq!(h.processor.stats().discarded, 1);
  }

  #[test]
  fn close_waits_for_delivery_in_progress() {
    let detector = Arc::new(ManualDetector::default());
    let (entered_tx, entered) = mpsc::channel();
    let (open, gate) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let gate = Mutex::new(gate);
    let results = move |meta: &FrameMeta, _: &DetectionResult| {
      entered_tx.lock().unwrap().send(meta.index).unwrap();
      let _ = gate.lock().unwrap().recv();
    };
    let errors = |_: &FrameMeta, _: &InferenceError| {};
    let processor = VisionProcessor::new(detector.clone(), Arc::new(results), Arc::new(errors));
    let pool = BufferPool::new(2);

    let outcome = processor.submit(frame(&pool, 1)).unwrap();
    let reply = detector.take();
    let delivering = thread::spawn(move || reply.resolve(Ok(1)));
    assert_eq!(entered.recv_timeout(Duration::from_secs(1)).unwrap(), 1);

    let (closed_tx, closed) = mpsc::channel();
    let closer = processor.clone();
    let closing = thread::spawn(move || {
      closer.close();
      closed_tx.send(()).unwrap();
    });
    // 输出回调仍在执行，close 不能先返回
    assert!(closed.recv_timeout(Duration::from_millis(100)).is_err());

    open.send(()).unwrap();
    closing.join().unwrap();
    delivering.join().unwrap();
    assert_eq!(settle(outcome), FrameOutcome::Delivered);
    assert_eq!(processor.state(), ProcessorState::Closed);
    assert_eq!(pool.stats().outstanding, 0);
  }

  #[test]
  fn dropping_last_handle_stops_detector() {
    let h = harness();
    let detector = h.detector.clone();
    drop(h);
    assert_eq!(detector.stops.load(Ordering::SeqCst), 1);
  }
}
