use crate::core::config::validate_identifier;
use crate::core::error::RuleResult;
use tokio_postgres::Client;

pub fn schema_sql(table: &str) -> String {
    format!(
        r#"
        -- IPルールテーブル
        CREATE TABLE IF NOT EXISTS {table} (
            ID BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
            IP TEXT NOT NULL UNIQUE,
            Action TEXT NOT NULL CHECK (Action IN ('allow', 'block')),
            DateAdded TIMESTAMPTZ NOT NULL,
            addType TEXT NOT NULL CHECK (addType IN ('manual', 'automatic', 'malicious'))
        );

        -- 追加種別での一覧・一括削除用
        CREATE INDEX IF NOT EXISTS idx_{table}_addtype ON {table} (addType);
        "#,
        table = table
    )
}

pub async fn run_migrations(client: &Client, table: &str) -> RuleResult<()> {
    validate_identifier(table)?;
    client.batch_execute(&schema_sql(table)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_uses_table_name() {
        let sql = schema_sql("ip_rules");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS ip_rules ("));
        assert!(sql.contains("idx_ip_rules_addtype ON ip_rules (addType)"));
        assert!(sql.contains("IP TEXT NOT NULL UNIQUE"));
        assert!(sql.contains("GENERATED BY DEFAULT AS IDENTITY"));
    }
}
