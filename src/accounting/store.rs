use rusqlite::params;
use serde::Serialize;

use crate::accounting::UsageRecord;
use crate::db::Database;
use crate::error::StoreError;

/// Append-only side of the usage store.
pub trait UsageStore: Send + Sync {
    /// Persist a batch atomically: either every record is written or none.
    fn append_usage_records(&self, records: &[UsageRecord]) -> Result<(), StoreError>;
}

impl UsageStore for Database {
    fn append_usage_records(&self, records: &[UsageRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                // exchange_id is unique, so a batch replayed after an
                // ambiguous failure cannot double count.
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO usage_records (exchange_id, request_id, user_id, \
                     api_key_id, model, provider, upstream_model, input_tokens, output_tokens, \
                     cost_in, cost_out, messages_cnt, finish_reason, status, latency_ms, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                )?;
                for record in records {
                    stmt.execute(params![
                        record.exchange_id,
                        record.request_id,
                        record.user_id,
                        record.api_key_id,
                        record.model,
                        record.provider,
                        record.upstream_model,
                        record.input_tokens,
                        record.output_tokens,
                        record.cost_in,
                        record.cost_out,
                        record.messages_cnt,
                        record.finish_reason,
                        record.status.as_str(),
                        i64::try_from(record.latency_ms).unwrap_or(i64::MAX),
                        record.created_at.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()
        })?;
        Ok(())
    }
}

/// Per-user aggregate over all usage records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserUsageSummary {
    pub user_id: String,
    pub user_name: Option<String>,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_in: f64,
    pub cost_out: f64,
    pub messages: i64,
    pub models: Vec<String>,
}

/// Aggregates per user, most expensive output first.
pub fn user_usage_summaries(db: &Database) -> Result<Vec<UserUsageSummary>, StoreError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT r.user_id, u.name, COUNT(*), SUM(r.input_tokens), SUM(r.output_tokens), \
             SUM(r.cost_in), SUM(r.cost_out), SUM(r.messages_cnt), GROUP_CONCAT(DISTINCT r.model) \
             FROM usage_records r LEFT JOIN users u ON u.id = r.user_id \
             GROUP BY r.user_id ORDER BY SUM(r.cost_out) DESC, r.user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let models: Option<String> = row.get(8)?;
            let mut models: Vec<String> = models
                .unwrap_or_default()
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            models.sort();
            Ok(UserUsageSummary {
                user_id: row.get(0)?,
                user_name: row.get(1)?,
                requests: row.get(2)?,
                input_tokens: row.get(3)?,
                output_tokens: row.get(4)?,
                cost_in: row.get(5)?,
                cost_out: row.get(6)?,
                messages: row.get(7)?,
                models,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })?;
    Ok(rows)
}
