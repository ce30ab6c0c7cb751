use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// 仓库名称白名单（逗号分隔）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter(BTreeSet<String>);

impl NameFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// 名称需完全匹配（区分大小写）
    pub fn allows(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for NameFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let filter = Self::new(
            s.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        );
        if filter.is_empty() {
            return Err(format!("repository filter '{}' contains no names", s));
        }
        Ok(filter)
    }
}

/// 嵌入访问令牌的克隆地址
///
/// 令牌以 basic-auth 用户名的形式写入 URL；`Debug` 和 `Display` 都会隐藏它。
/// 本地路径和 `file://` 地址原样保留。
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedUrl {
    raw: String,
    redacted: String,
}

impl AuthenticatedUrl {
    pub fn new(clone_url: &str, token: &str) -> Self {
        match Url::parse(clone_url) {
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                let mut redacted = url.clone();
                let _ = url.set_password(None);
                let _ = redacted.set_password(None);
                // set_username 只在 URL 无法携带凭证时失败，http(s) 不会
                let _ = url.set_username(token);
                let _ = redacted.set_username("redacted");
                Self {
                    raw: url.to_string(),
                    redacted: redacted.to_string(),
                }
            }
            _ => Self {
                raw: clone_url.to_string(),
                redacted: clone_url.to_string(),
            },
        }
    }

    /// 带凭证的原始地址，只用于写入 push 地址
    pub fn expose(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for AuthenticatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuthenticatedUrl").field(&self.redacted).finish()
    }
}

impl fmt::Display for AuthenticatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.redacted)
    }
}
