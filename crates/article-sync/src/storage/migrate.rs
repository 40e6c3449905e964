//! 数据库初始化与迁移 - 由 refinery 管理
//!
//! 统一入口 `init_db`：pragmas → migrate → 版本校验。
//! 新增迁移只需在 migrations/ 添加 V{n}__{name}.sql，编译期嵌入、启动时执行。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::version::SDK_DB_VERSION;

/// refinery 的 migration 历史表
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 本地镜像推荐 PRAGMA：WAL、NORMAL 同步、外键、内存临时表
const MIRROR_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIRROR_PRAGMAS.trim())
        .map_err(|e| SyncError::Migration(format!("设置 PRAGMA 失败: {}", e)))
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| SyncError::Migration(format!("执行 migration 失败: {}", e)))?;
    for migration in report.applied_migrations() {
        tracing::info!("已应用 migration: V{}__{}", migration.version(), migration.name());
    }
    Ok(())
}

/// 当前库的 migration 版本；无历史表返回 None
pub fn db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [REFINERY_TABLE],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn.query_row(
        &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
        [],
        |row| row.get::<_, Option<i64>>(0),
    )?;
    Ok(version.filter(|&v| v > 0))
}

/// 库版本高于本版本支持的最高版本时拒绝打开
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = db_migration_version(conn)? else {
        return Ok(());
    };
    if v > SDK_DB_VERSION {
        return Err(SyncError::Migration(format!(
            "数据库版本 {} 高于当前支持的最高版本 {}，请升级后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)?;
    Ok(())
}
