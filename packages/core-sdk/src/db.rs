use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};
use tracing::warn;

use crate::models::{Message, MessageStatus, Role};

pub const DEFAULT_DB_PATH: &str = "codedeck.db";

/**
 * \brief 打开指定路径的数据库并设置忙等待。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            content TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_messages_column(conn, "status", "TEXT NOT NULL DEFAULT 'complete'")?;
    ensure_messages_column(conn, "created_at", "INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

fn ensure_messages_column(conn: &Connection, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(messages)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        let sql = format!("ALTER TABLE messages ADD COLUMN {} {}", column, decl);
        retry_on_locked(|| conn.execute(&sql, []))?;
    }
    Ok(())
}

/**
 * \brief 读取配置项。
 */
pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

/**
 * \brief 写入配置项（存在则覆盖）。
 */
pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除配置项。
 */
pub fn delete_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

pub fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

pub fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_config(conn, key, if value { "1" } else { "0" })
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 插入一条消息。
 */
pub fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (id, role, content, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.role.as_str(),
                message.content,
                message.status.as_str(),
                message.created_at
            ],
        )
    })?;
    Ok(())
}

/**
 * \brief 更新消息正文。
 */
pub fn update_message_content(conn: &Connection, id: &str, content: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE messages SET content=?1 WHERE id=?2",
            params![content, id],
        )
    })?;
    if rows == 0 {
        bail!("message id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 更新消息状态。
 */
pub fn update_message_status(conn: &Connection, id: &str, status: MessageStatus) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE messages SET status=?1 WHERE id=?2",
            params![status.as_str(), id],
        )
    })?;
    if rows == 0 {
        bail!("message id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 按插入顺序读取全部消息；无法识别的行会被跳过。
 */
pub fn load_messages(conn: &Connection) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare("SELECT id, role, content, status, created_at FROM messages ORDER BY seq ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, role, content, status, created_at) in rows {
        let (Some(role), Some(status)) = (Role::parse(&role), MessageStatus::parse(&status)) else {
            warn!(message_id = %id, "skipping unreadable message row");
            continue;
        };
        messages.push(Message {
            id,
            role,
            content,
            status,
            created_at,
        });
    }
    Ok(messages)
}

/**
 * \brief 清空全部消息。
 */
pub fn clear_messages(conn: &Connection) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM messages", []))?;
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
pub(crate) fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
