//! 目标 key 与本地记录 key 的推导

use super::filter::base_name;

/// 源路径到目标 key 的映射，只依赖源路径和配置
#[derive(Debug, Clone)]
pub struct KeyMapper {
    src_root: String,
    ignore_dir: bool,
    key_prefix: String,
}

impl KeyMapper {
    pub fn new(src_root: &str, ignore_dir: bool, key_prefix: &str) -> Self {
        Self {
            src_root: src_root.to_string(),
            ignore_dir,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// 去掉源根目录和开头的 `/`
    pub fn relative_path<'a>(&self, source_path: &'a str) -> &'a str {
        let rel = source_path
            .strip_prefix(self.src_root.as_str())
            .unwrap_or(source_path);
        rel.strip_prefix('/').unwrap_or(rel)
    }

    /// 由相对路径生成目标 key
    pub fn destination_key(&self, rel_path: &str) -> String {
        let name = if self.ignore_dir {
            base_name(rel_path)
        } else {
            rel_path
        };
        format!("{}{}", self.key_prefix, name)
    }

    /// 本地记录 key：`源路径:目标 key`
    pub fn record_key(source_path: &str, key: &str) -> String {
        format!("{}:{}", source_path, key)
    }
}
