//! 版本与构建元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Migration Version** → migrations/ 文件名（refinery 管理）

/// crate semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（build.rs 中由 vergen 生成）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// 构建时间（build.rs 中由 vergen 生成）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 本版本支持的最高数据库 migration 版本。
/// 打开数据库时若发现更高版本则拒绝（防止降级后 schema 不兼容）。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 单行构建信息，启动日志用
pub fn build_info() -> String {
    format!("article-sync {} ({}, built {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_version_tracks_migrations() {
        assert!(SDK_DB_VERSION >= 2);
        assert_eq!(parse_db_version("17"), 17);
        assert_eq!(parse_db_version(""), 0);
    }
}
