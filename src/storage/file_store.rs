use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::core::error::{RuleError, RuleResult};
use crate::storage::atomic_write::{atomic_write, ensure_parent_dir};
use crate::storage::models::rule::{NewRule, OriginType, RuleAction, RuleRecord};
use crate::storage::repository::{plan_transition, RuleRepository};

type RuleDocument = BTreeMap<String, RuleRecord>;

/// IPアドレス→ルールのJSONドキュメント1つに全ルールを保存するストア
pub struct FileRuleStore {
    path: PathBuf,
    // 最後に払い出したid。ドキュメントの読み書き全体もこのロックで直列化する
    last_id: Mutex<i64>,
}

impl FileRuleStore {
    pub async fn open(path: impl AsRef<Path>) -> RuleResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dir(&path).await?;

        let document = read_document(&path).await?;
        let last_id = max_id(&document);
        info!("JSONルールファイルを読み込みました: {:?} ({}件)", path, document.len());

        let store = Self {
            path,
            last_id: Mutex::new(last_id),
        };
        store.ensure_exists().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_exists(&self) -> RuleResult<()> {
        if fs::metadata(&self.path).await.is_err() {
            write_document(&self.path, &RuleDocument::new()).await?;
            debug!("空のJSONルールファイルを作成しました: {:?}", self.path);
        }
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for FileRuleStore {
    async fn add(&self, rule: NewRule) -> RuleResult<RuleRecord> {
        let mut last_id = self.last_id.lock().await;
        let mut document = read_document(&self.path).await?;

        if document.contains_key(&rule.ip_address) {
            return Err(RuleError::AlreadyExists(rule.ip_address));
        }

        let id = (*last_id).max(max_id(&document)) + 1;
        let record = rule.into_record(id);
        document.insert(record.ip_address.clone(), record.clone());
        write_document(&self.path, &document).await?;

        *last_id = id;
        Ok(record)
    }

    async fn delete(&self, ip: &str) -> RuleResult<RuleRecord> {
        let _guard = self.last_id.lock().await;
        let mut document = read_document(&self.path).await?;

        let removed = document
            .remove(ip)
            .ok_or_else(|| RuleError::NotFound(ip.to_string()))?;
        write_document(&self.path, &document).await?;
        Ok(removed)
    }

    async fn get(&self, ip: &str) -> RuleResult<Option<RuleRecord>> {
        let _guard = self.last_id.lock().await;
        let mut document = read_document(&self.path).await?;
        Ok(document.remove(ip))
    }

    async fn load_all(&self) -> RuleResult<Vec<RuleRecord>> {
        let _guard = self.last_id.lock().await;
        let document = read_document(&self.path).await?;
        Ok(document.into_values().collect())
    }

    async fn clear_origin(&self, origin: OriginType) -> RuleResult<Vec<RuleRecord>> {
        let _guard = self.last_id.lock().await;
        let document = read_document(&self.path).await?;

        let (removed, kept): (RuleDocument, RuleDocument) = document
            .into_iter()
            .partition(|(_, rule)| rule.origin_type == origin);

        if !removed.is_empty() {
            write_document(&self.path, &kept).await?;
        }
        Ok(removed.into_values().collect())
    }

    async fn transition(&self, ip: &str, action: RuleAction) -> RuleResult<RuleRecord> {
        let mut last_id = self.last_id.lock().await;
        let mut document = read_document(&self.path).await?;

        let Some(next) = plan_transition(ip, document.get(ip), action)? else {
            return document
                .remove(ip)
                .ok_or_else(|| RuleError::NotFound(ip.to_string()));
        };

        // 削除と再追加を1回の書き込みにまとめる
        let id = (*last_id).max(max_id(&document)) + 1;
        let record = next.into_record(id);
        document.insert(record.ip_address.clone(), record.clone());
        write_document(&self.path, &document).await?;

        *last_id = id;
        Ok(record)
    }

    fn backend_name(&self) -> &'static str {
        "json"
    }
}

fn max_id(document: &RuleDocument) -> i64 {
    document.values().map(|rule| rule.id).max().unwrap_or(0)
}

async fn read_document(path: &Path) -> RuleResult<RuleDocument> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RuleDocument::new()),
        Err(e) => return Err(e.into()),
    };

    if raw.trim().is_empty() {
        return Ok(RuleDocument::new());
    }

    let document: RuleDocument = serde_json::from_str(&raw)?;
    for (key, rule) in &document {
        if key != &rule.ip_address {
            return Err(RuleError::InvalidData(format!(
                "キー {} とIPアドレス {} が一致しません",
                key, rule.ip_address
            )));
        }
    }
    Ok(document)
}

async fn write_document(path: &Path, document: &RuleDocument) -> RuleResult<()> {
    let json = serde_json::to_vec_pretty(document)?;
    atomic_write(path, &json).await?;
    Ok(())
}
