// 该文件是 Kanjian （看见） 项目的一部分。
// src/model/completion.rs - 一次性异步完成通知
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

//! # 一次性完成通知
//!
//! [`channel`] 返回一对 [`Resolver`] / [`Completion`]：
//!
//! - 生产方（推理引擎）持有 [`Resolver`]，调用 [`Resolver::resolve`] 交付结果；
//! - 消费方持有 [`Completion`]，可以用 [`Completion::on_complete`] 注册回调，
//!   也可以用 [`Completion::wait`] / [`Completion::wait_timeout`] 阻塞等待。
//!
//! 结果经由容量为 1 的通道交付；注册了回调时则直接在交付结果的线程上调用回调。
//! 若 [`Resolver`] 在交付前被丢弃（例如引擎关闭时丢弃了排队中的请求），
//! 完成通知以 [`Abandoned`] 结束，因此已注册的回调在任何路径上都会恰好执行一次。

use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;

/// 生产方在交付结果之前被丢弃
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("请求在完成前被放弃")]
pub struct Abandoned;

type Listener<T> = Box<dyn FnOnce(Result<T, Abandoned>) + Send>;

/// 回调槽位；交付与注册都在该锁下判断结果走通道还是走回调
type ListenerSlot<T> = Arc<Mutex<Option<Listener<T>>>>;

fn lock<T>(slot: &ListenerSlot<T>) -> MutexGuard<'_, Option<Listener<T>>> {
  slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn channel<T>() -> (Resolver<T>, Completion<T>) {
  let (tx, rx) = crossbeam_channel::bounded(1);
  let listener = Arc::new(Mutex::new(None));
  (
    Resolver {
      tx: Some(tx),
      listener: listener.clone(),
    },
    Completion { rx, listener },
  )
}

pub struct Resolver<T> {
  tx: Option<Sender<Result<T, Abandoned>>>,
  listener: ListenerSlot<T>,
}

impl<T> Resolver<T> {
  pub fn resolve(mut self, value: T) {
    self.settle(Ok(value));
  }

  fn settle(&mut self, result: Result<T, Abandoned>) {
    let Some(tx) = self.tx.take() else {
      return;
    };

    let mut slot = lock(&self.listener);
    match slot.take() {
      Some(listener) => {
        // 回调可能再次提交请求，先释放锁
        drop(slot);
        listener(result);
      }
      None => {
        // 容量为 1 且只发送一次，不会阻塞；消费方已丢弃时结果无人关心
        let _ = tx.send(result);
      }
    }
  }
}

impl<T> Drop for Resolver<T> {
  fn drop(&mut self) {
    self.settle(Err(Abandoned));
  }
}

#[must_use = "完成通知需要注册回调或等待，否则结果会被忽略"]
pub struct Completion<T> {
  rx: Receiver<Result<T, Abandoned>>,
  listener: ListenerSlot<T>,
}

impl<T> Completion<T> {
  /// 已经得到结果的完成通知
  pub fn ready(value: T) -> Self {
    let (resolver, completion) = channel();
    resolver.resolve(value);
    completion
  }

  /// 注册完成回调；若结果已就绪则立即在当前线程执行
  pub fn on_complete<F>(self, listener: F)
  where
    F: FnOnce(Result<T, Abandoned>) + Send + 'static,
  {
    let mut slot = lock(&self.listener);
    match self.rx.try_recv() {
      Ok(result) => {
        drop(slot);
        listener(result);
      }
      Err(TryRecvError::Disconnected) => {
        drop(slot);
        listener(Err(Abandoned));
      }
      Err(TryRecvError::Empty) => *slot = Some(Box::new(listener)),
    }
  }

  /// 结果是否已经交付
  pub fn is_settled(&self) -> bool {
    !self.rx.is_empty()
  }

  pub fn wait(self) -> Result<T, Abandoned> {
    self.rx.recv().unwrap_or(Err(Abandoned))
  }

  /// 限时等待；超时后原样返回 `Err(self)`，调用方可以继续等待
  pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, Abandoned>, Self> {
    match self.rx.recv_timeout(timeout) {
      Ok(result) => Ok(result),
      Err(RecvTimeoutError::Disconnected) => Ok(Err(Abandoned)),
      Err(RecvTimeoutError::Timeout) => Err(self),
    }
  }
}

impl<T> std::fmt::Debug for Completion<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Completion")
      .field("settled", &self.is_settled())
      .finish()
  }
}
