// src/storage/sql_store.rs
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use log::info;
use tokio_postgres::{NoTls, Row};

use crate::core::config::{validate_identifier, DatabaseConfig};
use crate::core::error::{RuleError, RuleResult};
use crate::storage::migrations::run_migrations;
use crate::storage::models::rule::{NewRule, OriginType, RuleAction, RuleRecord};
use crate::storage::repository::{plan_transition, RuleRepository};

const COLUMNS: &str = "ID, IP, Action, DateAdded, addType";

/// 1ルール1行でPostgreSQLのテーブルに保存するストア
pub struct SqlRuleStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    queries: Queries,
}

/// テーブル名を埋め込んだSQL文
#[derive(Debug, Clone)]
struct Queries {
    table: String,
    insert: String,
    delete: String,
    select_one: String,
    select_one_for_update: String,
    select_all: String,
    clear_origin: String,
}

impl Queries {
    fn new(table: &str) -> RuleResult<Self> {
        validate_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
            insert: format!(
                "INSERT INTO {table} (IP, Action, DateAdded, addType) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (IP) DO NOTHING RETURNING {COLUMNS}"
            ),
            delete: format!("DELETE FROM {table} WHERE IP = $1 RETURNING {COLUMNS}"),
            select_one: format!("SELECT {COLUMNS} FROM {table} WHERE IP = $1"),
            select_one_for_update: format!("SELECT {COLUMNS} FROM {table} WHERE IP = $1 FOR UPDATE"),
            select_all: format!(
                "SELECT {COLUMNS} FROM {table} \
                 ORDER BY CASE WHEN addType = 'manual' THEN 0 ELSE 1 END, addType, ID"
            ),
            clear_origin: format!("DELETE FROM {table} WHERE addType = $1 RETURNING {COLUMNS}"),
        })
    }
}

impl SqlRuleStore {
    pub async fn connect(config: &DatabaseConfig) -> RuleResult<Self> {
        let queries = Queries::new(&config.table)?;

        let manager = PostgresConnectionManager::new_from_stringlike(config.connection_string(), NoTls)?;
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(config.connect_timeout)
            .build(manager)
            .await?;

        let store = Self { pool, queries };
        {
            let client = store.get_client().await?;
            run_migrations(&client, &store.queries.table).await?;
        }
        info!(
            "データベースに接続しました: {}:{}/{} (テーブル: {})",
            config.host, config.port, config.database, config.table
        );
        Ok(store)
    }

    pub async fn get_client(&self) -> RuleResult<PooledConnection<'_, PostgresConnectionManager<NoTls>>> {
        Ok(self.pool.get().await?)
    }
}

fn row_to_record(row: &Row) -> RuleResult<RuleRecord> {
    let id: i64 = row.try_get(0)?;
    let ip_address: String = row.try_get(1)?;
    let action: RuleAction = row.try_get(2)?;
    let date_added: DateTime<Utc> = row.try_get(3)?;
    let origin_type: OriginType = row.try_get(4)?;

    if ip_address.is_empty() {
        return Err(RuleError::InvalidData(format!("ID {} のIPアドレスが空です", id)));
    }

    Ok(RuleRecord {
        id,
        ip_address,
        action,
        date_added,
        origin_type,
    })
}

fn rows_to_records(rows: &[Row]) -> RuleResult<Vec<RuleRecord>> {
    rows.iter().map(row_to_record).collect()
}

#[async_trait]
impl RuleRepository for SqlRuleStore {
    async fn add(&self, rule: NewRule) -> RuleResult<RuleRecord> {
        let client = self.get_client().await?;

        let row = client
            .query_opt(
                self.queries.insert.as_str(),
                &[&rule.ip_address, &rule.action, &rule.date_added, &rule.origin_type],
            )
            .await?;

        match row {
            Some(row) => row_to_record(&row),
            None => Err(RuleError::AlreadyExists(rule.ip_address)),
        }
    }

    async fn delete(&self, ip: &str) -> RuleResult<RuleRecord> {
        let client = self.get_client().await?;

        match client.query_opt(self.queries.delete.as_str(), &[&ip]).await? {
            Some(row) => row_to_record(&row),
            None => Err(RuleError::NotFound(ip.to_string())),
        }
    }

    async fn get(&self, ip: &str) -> RuleResult<Option<RuleRecord>> {
        let client = self.get_client().await?;

        client
            .query_opt(self.queries.select_one.as_str(), &[&ip])
            .await?
            .map(|row| row_to_record(&row))
            .transpose()
    }

    async fn load_all(&self) -> RuleResult<Vec<RuleRecord>> {
        let client = self.get_client().await?;
        let rows = client.query(self.queries.select_all.as_str(), &[]).await?;
        rows_to_records(&rows)
    }

    async fn clear_origin(&self, origin: OriginType) -> RuleResult<Vec<RuleRecord>> {
        let client = self.get_client().await?;
        let rows = client.query(self.queries.clear_origin.as_str(), &[&origin]).await?;
        rows_to_records(&rows)
    }

    async fn transition(&self, ip: &str, action: RuleAction) -> RuleResult<RuleRecord> {
        let mut client = self.get_client().await?;
        let transaction = client.transaction().await?;

        let current = transaction
            .query_opt(self.queries.select_one_for_update.as_str(), &[&ip])
            .await?
            .map(|row| row_to_record(&row))
            .transpose()?;

        let Some(next) = plan_transition(ip, current.as_ref(), action)? else {
            return current.ok_or_else(|| RuleError::NotFound(ip.to_string()));
        };

        // 削除と再追加を同じトランザクションで行い、新しいidを払い出す
        transaction.execute(self.queries.delete.as_str(), &[&ip]).await?;
        let row = transaction
            .query_one(
                self.queries.insert.as_str(),
                &[&next.ip_address, &next.action, &next.date_added, &next.origin_type],
            )
            .await?;
        let record = row_to_record(&row)?;
        transaction.commit().await?;
        Ok(record)
    }

    fn backend_name(&self) -> &'static str {
        "sql"
    }
}
