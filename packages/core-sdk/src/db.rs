use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
    thread,
    time::Duration,
};

pub const KEY_USER_API_KEY: &str = "user_api_key";
pub const KEY_PROVIDER: &str = "provider";
pub const KEY_HISTORY: &str = "history";
pub const KEY_TELEMETRY: &str = "telemetry_enabled";

/**
 * \brief 键值存储协作者边界：凭据、Provider 选择与历史记录都经由它持久化。
 */
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /**
     * \brief 原子读改写。闭包返回 None 表示删除该键。
     */
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()>;
}

/**
 * \brief 打开默认数据库文件（`NIX_DB_PATH`，缺省为本地目录下的 nix.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("NIX_DB_PATH").unwrap_or_else(|_| "nix.db".to_string());
    open_db(&path)
}

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
        "#,
        )
    })?;
    Ok(())
}

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

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

pub fn delete_config(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 基于 SQLite `app_config` 表的键值存储。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 接管已有连接并执行迁移。
     */
    pub fn new(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::new(open_default_db()?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /**
     * \brief 在持锁状态下访问底层连接。
     */
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&guard)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| get_config(conn, key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| set_config(conn, key, value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| delete_config(conn, key))
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = get_config(&tx, key)?;
        match f(current)? {
            Some(value) => set_config(&tx, key, &value)?,
            None => delete_config(&tx, key)?,
        }
        tx.commit()?;
        Ok(())
    }
}

/**
 * \brief 进程内键值存储，用于测试夹具与无盘场景。
 */
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.map
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<()> {
        let mut map = self.lock()?;
        match f(map.get(key).cloned())? {
            Some(value) => {
                map.insert(key.to_string(), value);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_config_roundtrip_and_delete() {
        let conn = mem_conn();
        assert_eq!(get_config(&conn, KEY_PROVIDER).unwrap(), None);
        set_config(&conn, KEY_PROVIDER, "gemini").expect("set");
        set_config(&conn, KEY_PROVIDER, "openai").expect("overwrite");
        assert_eq!(
            get_config(&conn, KEY_PROVIDER).unwrap().as_deref(),
            Some("openai")
        );
        delete_config(&conn, KEY_PROVIDER).expect("delete");
        assert_eq!(get_config(&conn, KEY_PROVIDER).unwrap(), None);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        set_config(&conn, "k", "v").unwrap();
        migrate(&conn).expect("second migrate");
        assert_eq!(get_config(&conn, "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_sqlite_store_update_commits_and_removes() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .update("counter", &mut |cur| {
                assert!(cur.is_none());
                Ok(Some("1".into()))
            })
            .unwrap();
        store
            .update("counter", &mut |cur| {
                let n: i32 = cur.unwrap().parse()?;
                Ok(Some((n + 1).to_string()))
            })
            .unwrap();
        assert_eq!(store.get("counter").unwrap().as_deref(), Some("2"));

        store.update("counter", &mut |_| Ok(None)).unwrap();
        assert_eq!(store.get("counter").unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_update_error_rolls_back() {
        let store = SqliteStore::open_in_memory().expect("store");
        store.set("k", "before").unwrap();
        let res = store.update("k", &mut |_| Err(anyhow!("boom")));
        assert!(res.is_err());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("before"));
    }

    #[test]
    fn test_sqlite_store_persists_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nix.db");
        {
            let store = SqliteStore::new(open_db(&path).unwrap()).unwrap();
            store.set(KEY_USER_API_KEY, "gsk_abc").unwrap();
        }
        let store = SqliteStore::new(open_db(&path).unwrap()).unwrap();
        assert_eq!(
            store.get(KEY_USER_API_KEY).unwrap().as_deref(),
            Some("gsk_abc")
        );
    }

    #[test]
    fn test_memory_store_matches_contract() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store
            .update("a", &mut |cur| Ok(cur.map(|v| format!("{v}1"))))
            .unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("11"));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }
}
