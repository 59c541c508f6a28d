//! 跳过规则 - 按文件名前缀、路径前缀、后缀、包含字符串排除文件

use std::fmt;
use tracing::warn;

/// 命中的规则类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipRule {
    FilePrefix,
    PathPrefix,
    Suffix,
    FixedString,
}

impl fmt::Display for SkipRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipRule::FilePrefix => write!(f, "文件名前缀"),
            SkipRule::PathPrefix => write!(f, "路径前缀"),
            SkipRule::Suffix => write!(f, "后缀"),
            SkipRule::FixedString => write!(f, "包含字符串"),
        }
    }
}

/// 跳过规则集合
#[derive(Debug, Clone, Default)]
pub struct SkipRules {
    file_prefixes: Vec<String>,
    path_prefixes: Vec<String>,
    suffixes: Vec<String>,
    fixed_strings: Vec<String>,
}

/// 解析逗号分隔的规则列表
///
/// 整个列表为空白时没有规则。末尾的连续空项被丢弃，中间的空项（包括只有空白的项）
/// 保留为空字符串，空规则匹配所有路径。
fn parse_list(list: &str) -> Vec<String> {
    if list.trim().is_empty() {
        return Vec::new();
    }
    let mut pieces: Vec<&str> = list.split(',').collect();
    while pieces.last() == Some(&"") {
        pieces.pop();
    }
    let pieces: Vec<String> = pieces.into_iter().map(|p| p.trim().to_string()).collect();
    if pieces.iter().any(String::is_empty) {
        warn!("跳过规则 {:?} 包含空项，将匹配所有文件", list);
    }
    pieces
}

/// 取路径的最后一段
pub fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

impl SkipRules {
    pub fn new(file_prefixes: &str, path_prefixes: &str, suffixes: &str, fixed_strings: &str) -> Self {
        Self {
            file_prefixes: parse_list(file_prefixes),
            path_prefixes: parse_list(path_prefixes),
            suffixes: parse_list(suffixes),
            fixed_strings: parse_list(fixed_strings),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.file_prefixes.is_empty()
            && self.path_prefixes.is_empty()
            && self.suffixes.is_empty()
            && self.fixed_strings.is_empty()
    }

    /// 返回第一个命中的规则类别，依次检查文件名前缀、路径前缀、后缀、包含字符串
    pub fn match_rule(&self, rel_path: &str) -> Option<SkipRule> {
        let name = base_name(rel_path);
        if self.file_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            return Some(SkipRule::FilePrefix);
        }
        if self.path_prefixes.iter().any(|p| rel_path.starts_with(p.as_str())) {
            return Some(SkipRule::PathPrefix);
        }
        if self.suffixes.iter().any(|s| rel_path.ends_with(s.as_str())) {
            return Some(SkipRule::Suffix);
        }
        if self.fixed_strings.iter().any(|s| rel_path.contains(s.as_str())) {
            return Some(SkipRule::FixedString);
        }
        None
    }

    pub fn should_skip(&self, rel_path: &str) -> bool {
        self.match_rule(rel_path).is_some()
    }
}
