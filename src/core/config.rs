use crate::core::error::{RuleError, RuleResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub backend: StorageBackend,
    pub storage: StorageConfig,
    pub database: Option<DatabaseConfig>,
    pub max_ips_per_page: usize,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub rules_json_path: PathBuf,
    pub directive_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: log::LevelFilter,
    pub file: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.username, self.password, self.database
        )
    }
}

impl Configuration {
    pub fn from_env() -> RuleResult<Self> {
        dotenv::dotenv().ok();
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// 任意の取得関数から設定を組み立てる (テストではHashMapを渡す)
    pub fn from_source<F>(lookup: F) -> RuleResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("RULE_BACKEND") {
            Some(value) => parse_backend(&value)?,
            None => {
                // 旧設定のUSE_DBも受け付ける
                let use_db = match lookup("USE_DB") {
                    Some(flag) => parse_bool("USE_DB", &flag)?,
                    None => false,
                };
                if use_db {
                    StorageBackend::Sql
                } else {
                    StorageBackend::File
                }
            }
        };

        let storage = StorageConfig {
            rules_json_path: lookup("RULES_JSON_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("host_data").join("ips.json")),
            directive_file_path: lookup("DIRECTIVE_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("host_data").join("ips.conf")),
        };

        let max_ips_per_page: usize = parse_or("MAX_IPS_PER_PAGE", lookup("MAX_IPS_PER_PAGE"), 10)?;
        if max_ips_per_page == 0 {
            return Err(RuleError::Config("MAX_IPS_PER_PAGEは1以上である必要があります".to_string()));
        }

        let database = match backend {
            StorageBackend::Sql => Some(database_config(&lookup)?),
            StorageBackend::File => None,
        };

        let level = match lookup("LOG_LEVEL") {
            Some(value) => value
                .parse::<log::LevelFilter>()
                .map_err(|e| RuleError::Config(format!("無効なログレベル: {}", e)))?,
            None => log::LevelFilter::Info,
        };

        Ok(Configuration {
            backend,
            storage,
            database,
            max_ips_per_page,
            log: LogConfig {
                level,
                file: lookup("LOG_FILE").map(PathBuf::from),
            },
        })
    }

    #[cfg(test)]
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            backend: StorageBackend::File,
            storage: StorageConfig {
                rules_json_path: dir.join("ips.json"),
                directive_file_path: dir.join("ips.conf"),
            },
            database: None,
            max_ips_per_page: 10,
            log: LogConfig {
                level: log::LevelFilter::Debug,
                file: None,
            },
        }
    }
}

fn database_config<F>(lookup: &F) -> RuleResult<DatabaseConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| {
        lookup(key).ok_or_else(|| RuleError::Config(format!("{}が設定されていません", key)))
    };

    let table = lookup("DB_TABLE").unwrap_or_else(|| "ip_rules".to_string());
    validate_identifier(&table)?;

    Ok(DatabaseConfig {
        host: required("DB_HOST")?,
        port: parse_or("DB_PORT", lookup("DB_PORT"), 5432)?,
        username: required("DB_USER")?,
        password: required("DB_PASSWORD")?,
        database: required("DB_NAME")?,
        table,
        max_connections: parse_or("DB_MAX_CONNECTIONS", lookup("DB_MAX_CONNECTIONS"), 10)?,
        connect_timeout: Duration::from_secs(parse_or(
            "DB_CONNECT_TIMEOUT_SECS",
            lookup("DB_CONNECT_TIMEOUT_SECS"),
            5,
        )?),
    })
}

/// SQL文に埋め込むテーブル名を検証する
pub fn validate_identifier(name: &str) -> RuleResult<()> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if head_ok && tail_ok && name.len() <= 63 {
        Ok(())
    } else {
        Err(RuleError::Config(format!("無効なテーブル名: {}", name)))
    }
}

fn parse_backend(value: &str) -> RuleResult<StorageBackend> {
    match value.trim().to_ascii_lowercase().as_str() {
        "file" | "json" => Ok(StorageBackend::File),
        "sql" | "db" | "postgres" => Ok(StorageBackend::Sql),
        other => Err(RuleError::Config(format!("無効なバックエンド: {}", other))),
    }
}

fn parse_bool(key: &str, value: &str) -> RuleResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(RuleError::Config(format!("{}の値が不正です: {}", key, other))),
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> RuleResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RuleError::Config(format!("{}の値が不正です: {}", key, e))),
        None => Ok(default),
    }
}
