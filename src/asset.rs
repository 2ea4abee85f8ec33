// 该文件是 Xunlu （寻路） 项目的一部分。
// src/asset.rs - 模型资源路径解析
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

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::FromUrl;

const WEB_DIR: &str = "public";
const ASSETS_PREFIX: &str = "assets/";

#[derive(Error, Debug)]
pub enum AssetError {
  #[error("empty asset path")]
  Empty,
  #[error("asset path escapes the asset root: {0}")]
  Escapes(String),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("invalid file URL: {0}")]
  InvalidFileUrl(String),
}

/// 打包资源根目录，逻辑路径解析到 `<root>/public/` 下
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRoot {
  root: PathBuf,
  web_dir: String,
}

impl AssetRoot {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      web_dir: WEB_DIR.to_string(),
    }
  }

  pub fn with_web_dir(mut self, web_dir: impl Into<String>) -> Self {
    self.web_dir = web_dir.into();
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// 规范化逻辑路径：去掉开头的 `/`、`assets/` 与 web 目录前缀
  pub fn logical_path(&self, path: &str) -> Result<String, AssetError> {
    let mut rest = path.trim().trim_start_matches('/');
    if let Some(stripped) = rest.strip_prefix(ASSETS_PREFIX) {
      rest = stripped;
    }
    if let Some(stripped) = rest
      .strip_prefix(self.web_dir.as_str())
      .and_then(|s| s.strip_prefix('/'))
    {
      rest = stripped;
    }

    let mut parts = Vec::new();
    for component in Path::new(rest).components() {
      match component {
        Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        Component::CurDir => {}
        _ => return Err(AssetError::Escapes(path.to_string())),
      }
    }

    if parts.is_empty() {
      return Err(AssetError::Empty);
    }
    Ok(parts.join("/"))
  }

  pub fn resolve(&self, path: &str) -> Result<PathBuf, AssetError> {
    let logical = self.logical_path(path)?;
    let resolved = self.root.join(&self.web_dir).join(&logical);
    debug!("资源路径 {} 解析为 {}", path, resolved.display());
    Ok(resolved)
  }
}

impl Default for AssetRoot {
  fn default() -> Self {
    Self::new(".")
  }
}

/// 模型位置：打包资源内的逻辑路径，或本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
  Asset(String),
  File(PathBuf),
}

const ASSET_SCHEME: &str = "asset";
const FILE_SCHEME: &str = "file";

impl FromUrl for ModelLocation {
  type Error = AssetError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ASSET_SCHEME => {
        let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
        Ok(ModelLocation::Asset(path))
      }
      FILE_SCHEME => url
        .to_file_path()
        .map(ModelLocation::File)
        .map_err(|_| AssetError::InvalidFileUrl(url.to_string())),
      other => {
        error!(
          "URI scheme mismatch: expected '{}' or '{}', found '{}'",
          ASSET_SCHEME, FILE_SCHEME, other
        );
        Err(AssetError::SchemeMismatch(other.to_string()))
      }
    }
  }
}

impl ModelLocation {
  pub fn resolve(&self, assets: &AssetRoot) -> Result<PathBuf, AssetError> {
    match self {
      ModelLocation::Asset(path) => assets.resolve(path),
      ModelLocation::File(path) => Ok(path.clone()),
    }
  }
}
