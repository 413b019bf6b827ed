use std::sync::Arc;

use anyhow::{bail, Context, Result};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::db::{KvStore, KEY_HISTORY};
use crate::models::HistoryEntry;
use crate::prompts::LEVELS;
use crate::telemetry;

/** \brief 最多保留的历史条数。 */
pub const HISTORY_LIMIT: usize = 10;

/**
 * \brief 有界历史记录，以 JSON 数组存于键值存储，新条目在前。
 */
#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn KvStore>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /**
     * \brief 追加一条记录；插入与截断在同一次原子读改写中完成。
     */
    pub fn append(&self, query: &str, response: &str, level: u8) -> Result<HistoryEntry> {
        if level as usize >= LEVELS.len() {
            bail!("invalid complexity level {}", level);
        }
        let now = OffsetDateTime::now_utc();
        let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let timestamp = now.format(&Rfc3339)?;

        let mut created = None;
        self.store.update(KEY_HISTORY, &mut |current| {
            let mut entries = decode(current.as_deref());
            let id = match entries.iter().map(|e| e.id).max() {
                Some(newest) if newest >= now_ms => newest + 1,
                _ => now_ms,
            };
            let entry = HistoryEntry {
                id,
                query: query.to_string(),
                response: response.to_string(),
                level,
                timestamp: timestamp.clone(),
            };
            entries.insert(0, entry.clone());
            entries.truncate(HISTORY_LIMIT);
            created = Some(entry);
            Ok(Some(serde_json::to_string(&entries)?))
        })?;
        created.context("history update did not run")
    }

    /**
     * \brief 全部记录，新条目在前。
     */
    pub fn all(&self) -> Result<Vec<HistoryEntry>> {
        Ok(decode(self.store.get(KEY_HISTORY)?.as_deref()))
    }

    pub fn recent(&self, n: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.all()?;
        entries.truncate(n);
        Ok(entries)
    }

    pub fn latest(&self) -> Result<Option<HistoryEntry>> {
        Ok(self.all()?.into_iter().next())
    }

    /**
     * \brief 按 id 删除，返回是否确有删除。
     */
    pub fn delete(&self, id: i64) -> Result<bool> {
        let mut removed = false;
        self.store.update(KEY_HISTORY, &mut |current| {
            let mut entries = decode(current.as_deref());
            let before = entries.len();
            entries.retain(|e| e.id != id);
            removed = entries.len() != before;
            Ok(Some(serde_json::to_string(&entries)?))
        })?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(KEY_HISTORY)
    }
}

fn decode(raw: Option<&str>) -> Vec<HistoryEntry> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<HistoryEntry>>(raw) {
        Ok(mut entries) => {
            entries.sort_by(|a, b| b.id.cmp(&a.id));
            entries.truncate(HISTORY_LIMIT);
            entries
        }
        Err(err) => {
            telemetry::log_error("history.decode", &format!("discarding stored history: {}", err));
            Vec::new()
        }
    }
}
