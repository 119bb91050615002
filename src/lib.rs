// 该文件是 Kanjian （看见） 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod processor;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 解码 URL 中的路径部分（处理空格、中文等转义字符）
pub(crate) fn decode_url_path(url: &url::Url) -> String {
  urlencoding::decode(url.path())
    .map(|path| path.into_owned())
    .unwrap_or_else(|_| url.path().to_string())
}

/// 读取 URL 查询参数并解析为指定类型，缺失或无法解析时返回 `None`
pub(crate) fn query_param<T: std::str::FromStr>(url: &url::Url, key: &str) -> Option<T> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .and_then(|(_, v)| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn decode_url_path_handles_escapes() {
    let url = Url::parse("image:///tmp/my%20frames/%E5%9B%BE.png").unwrap();
    assert_eq!(decode_url_path(&url), "/tmp/my frames/图.png");
  }

  #[test]
  fn query_param_parses_or_skips() {
    let url = Url::parse("synthetic://camera?fps=30&width=abc").unwrap();
    assert_eq!(query_param::<u32>(&url, "fps"), Some(30));
    assert_eq!(query_param::<u32>(&url, "width"), None);
    assert_eq!(query_param::<u32>(&url, "height"), None);
  }
}
