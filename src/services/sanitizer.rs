use regex::bytes::Regex;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::LazyLock;
use tokio::fs;
use tracing::debug;
use crate::domain::entities::LocalMirror;
use crate::shared::error::MirrorError;
use crate::shared::result::Result;

/// 托管平台为合并请求生成的只读引用所在目录
const PULL_REFS_DIR: &str = "refs/pull";
const PACKED_REFS: &str = "packed-refs";

/// `<40 位十六进制> refs/pull/<编号>/(head|pull|merge)`，行尾换行符不参与匹配
static PULL_REF_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{40} refs/pull/[0-9]+/(head|pull|merge)\r?$")
        .expect("pull ref pattern is valid")
});

/// 清理结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SanitizeSummary {
    pub loose_refs_removed: bool,
    pub packed_lines_removed: usize,
}

/// 引用清理器 - 推送前移除托管平台注入的只读引用
///
/// 每次 fetch 之后都可能重新带回这些引用，所以每轮推送前都要执行。
pub struct RefSanitizer;

impl RefSanitizer {
    pub async fn sanitize(mirror: &LocalMirror) -> Result<SanitizeSummary> {
        let loose_refs_removed = remove_loose_pull_refs(&mirror.path.join(PULL_REFS_DIR)).await?;
        let packed_lines_removed = rewrite_packed_refs(&mirror.path.join(PACKED_REFS)).await?;

        debug!(
            loose_refs_removed,
            packed_lines_removed, "Sanitized mirror {}", mirror.name
        );

        Ok(SanitizeSummary {
            loose_refs_removed,
            packed_lines_removed,
        })
    }
}

/// 删除 `refs/pull` 下的松散引用文件
async fn remove_loose_pull_refs(dir: &Path) -> Result<bool> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MirrorError::RefSanitization {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// 重写 packed-refs，只去掉匹配的行
async fn rewrite_packed_refs(path: &Path) -> Result<usize> {
    let sanitization_error = |source| MirrorError::RefSanitization {
        path: path.to_path_buf(),
        source,
    };

    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(sanitization_error(e)),
    };

    let (kept, removed) = strip_pull_refs(&content);
    if removed == 0 {
        return Ok(0);
    }

    // 先写临时文件再重命名，避免留下写了一半的 packed-refs
    let tmp = path.with_extension("orgmirror.tmp");
    fs::write(&tmp, &kept).await.map_err(sanitization_error)?;
    fs::rename(&tmp, path).await.map_err(sanitization_error)?;

    Ok(removed)
}

/// 去掉 packed-refs 中的只读引用行，其余行逐字节保留且顺序不变
///
/// 返回保留的内容和删除的行数。
pub fn strip_pull_refs(content: &[u8]) -> (Vec<u8>, usize) {
    let mut kept = Vec::with_capacity(content.len());
    let mut removed = 0;

    for line in content.split_inclusive(|b| *b == b'\n') {
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        if PULL_REF_LINE.is_match(body) {
            removed += 1;
        } else {
            kept.extend_from_slice(line);
        }
    }

    (kept, removed)
}
