use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::config::{Configuration, StorageBackend};
use crate::core::error::{RuleError, RuleResult};
use crate::directive::DirectiveFile;
use crate::geo::{GeoLocation, GeoLookup};
use crate::query::{self, RuleFilter, RulePage};
use crate::storage::file_store::FileRuleStore;
use crate::storage::models::rule::{NewRule, OriginType, RuleAction, RuleRecord};
use crate::storage::repository::RuleRepository;
use crate::storage::sql_store::SqlRuleStore;
use crate::validation::validate_ipv4;

/// ルールストアとディレクティブファイルをまとめて扱う窓口。
///
/// 更新系はストアの変更からディレクティブ同期までを書き込みロックの中で行い、
/// 参照系は読み込みロックを取る。
pub struct RuleService {
    repository: Arc<dyn RuleRepository>,
    directive: DirectiveFile,
    page_size: usize,
    geo: Option<Arc<dyn GeoLookup>>,
    lock: RwLock<()>,
}

impl RuleService {
    pub fn new(repository: Arc<dyn RuleRepository>, directive: DirectiveFile, page_size: usize) -> Self {
        Self {
            repository,
            directive,
            page_size: page_size.max(1),
            geo: None,
            lock: RwLock::new(()),
        }
    }

    pub fn with_geo_lookup(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub async fn open(config: &Configuration) -> RuleResult<Self> {
        let repository: Arc<dyn RuleRepository> = match config.backend {
            StorageBackend::File => {
                info!("JSONファイルからIPルールを読み込みます");
                Arc::new(FileRuleStore::open(&config.storage.rules_json_path).await?)
            }
            StorageBackend::Sql => {
                info!("データベースからIPルールを読み込みます");
                let database = config
                    .database
                    .as_ref()
                    .ok_or_else(|| RuleError::Config("データベース設定がありません".to_string()))?;
                Arc::new(SqlRuleStore::connect(database).await?)
            }
        };

        let directive = DirectiveFile::new(&config.storage.directive_file_path);
        directive.ensure_exists().await?;

        Ok(Self::new(repository, directive, config.max_ips_per_page))
    }

    pub fn repository(&self) -> &Arc<dyn RuleRepository> {
        &self.repository
    }

    pub fn directive(&self) -> &DirectiveFile {
        &self.directive
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub async fn list(&self, page: usize, filter: &str) -> RuleResult<RulePage> {
        let _guard = self.lock.read().await;
        let rules = self.repository.list().await?;
        let filter = RuleFilter::from_token(filter);
        let result = query::page(&rules, page, self.page_size, &filter);

        info!(
            "ページ{}を取得しました (フィルター: {:?}, 件数: {}, 総ページ数: {})",
            page,
            filter,
            result.rules.len(),
            result.total_pages
        );
        Ok(result)
    }

    pub async fn get(&self, ip: &str) -> RuleResult<Option<RuleRecord>> {
        validate_ipv4(ip)?;
        let _guard = self.lock.read().await;
        self.repository.get(ip).await
    }

    /// 管理画面からの手動追加
    pub async fn add(&self, ip: &str, action: &str) -> RuleResult<RuleRecord> {
        let action = parse_required::<RuleAction>("アクション", action)?;
        self.add_rule(ip, action, OriginType::Manual, Utc::now()).await
    }

    /// 自動処理や脅威フィードからの追加
    pub async fn add_rule(
        &self,
        ip: &str,
        action: RuleAction,
        origin: OriginType,
        date_added: DateTime<Utc>,
    ) -> RuleResult<RuleRecord> {
        validate_ipv4(ip)?;
        let _guard = self.lock.write().await;

        let record = self
            .repository
            .add(NewRule::new(ip, action, origin, date_added))
            .await?;
        info!("[{}] IPルールを追加しました: {} {} ({})", self.repository.backend_name(), action, ip, origin);

        // 同期に失敗した削除や手書きの行が残っていても1アドレス1行にする
        self.directive
            .replace_line(ip, action)
            .await
            .map_err(|e| out_of_sync(ip, e))?;
        Ok(record)
    }

    pub async fn delete(&self, ip: &str) -> RuleResult<RuleRecord> {
        validate_ipv4(ip)?;
        let _guard = self.lock.write().await;

        let removed = self.repository.delete(ip).await?;
        info!("[{}] IPルールを削除しました: {}", self.repository.backend_name(), ip);

        self.directive
            .remove_line(ip)
            .await
            .map_err(|e| out_of_sync(ip, e))?;
        Ok(removed)
    }

    pub async fn set_action(&self, ip: &str, action: &str) -> RuleResult<RuleRecord> {
        validate_ipv4(ip)?;
        let action = parse_required::<RuleAction>("アクション", action)?;
        let _guard = self.lock.write().await;

        let record = self.repository.transition(ip, action).await?;
        info!(
            "[{}] {} のアクションを {} に変更しました (id: {})",
            self.repository.backend_name(),
            ip,
            record.action,
            record.id
        );
        self.directive
            .replace_line(ip, record.action)
            .await
            .map_err(|e| out_of_sync(ip, e))?;
        Ok(record)
    }

    /// 指定した追加種別のルールをすべて削除し、削除件数を返す
    pub async fn clear(&self, origin: &str) -> RuleResult<usize> {
        let origin = parse_required::<OriginType>("追加種別", origin)?;
        let _guard = self.lock.write().await;

        let removed = self.repository.clear_origin(origin).await?;
        info!(
            "[{}] {} のIPルールを{}件削除しました",
            self.repository.backend_name(),
            origin,
            removed.len()
        );

        let ips: HashSet<String> = removed.iter().map(|rule| rule.ip_address.clone()).collect();
        self.directive
            .remove_lines(&ips)
            .await
            .map_err(|e| out_of_sync(&format!("追加種別 {}", origin), e))?;
        Ok(removed.len())
    }

    /// ストアの内容からディレクティブファイルを作り直す
    pub async fn reconcile(&self) -> RuleResult<usize> {
        let _guard = self.lock.write().await;
        let rules = self.repository.list().await?;
        self.directive
            .rewrite_all(&rules)
            .await
            .map_err(|e| out_of_sync("全ルールの再生成", e))?;
        info!("ディレクティブファイルを{}件のルールから再生成しました", rules.len());
        Ok(rules.len())
    }

    pub fn geo_lookup(&self, ip: &str) -> RuleResult<Option<GeoLocation>> {
        validate_ipv4(ip)?;
        let address: Ipv4Addr = ip
            .parse()
            .map_err(|_| RuleError::Validation(format!("無効なIPアドレス形式: {}", ip)))?;

        match &self.geo {
            Some(geo) => Ok(geo.lookup(address)),
            None => {
                warn!("位置情報データベースが設定されていません");
                Ok(None)
            }
        }
    }
}

fn parse_required<T>(label: &str, value: &str) -> RuleResult<T>
where
    T: std::str::FromStr<Err = RuleError>,
{
    if value.trim().is_empty() {
        return Err(RuleError::Validation(format!("{}は必須です", label)));
    }
    value.parse()
}

fn out_of_sync(target: &str, source: std::io::Error) -> RuleError {
    warn!(
        "ストアは更新されましたがディレクティブファイルの同期に失敗しました (対象: {}): {}。reconcileで修復してください",
        target, source
    );
    RuleError::DirectiveSync {
        target: target.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::storage::repository::tests::MemoryRepository;
    use tempfile::{tempdir, TempDir};

    async fn file_service() -> (TempDir, RuleService) {
        let dir = tempdir().unwrap();
        let config = Configuration::for_testing(dir.path());
        let service = RuleService::open(&config).await.unwrap();
        (dir, service)
    }

    async fn directive_lines(service: &RuleService) -> Vec<String> {
        service.directive().read_lines().await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_both_files() {
        let (dir, _service) = file_service().await;
        assert!(dir.path().join("ips.json").exists());
        assert!(dir.path().join("ips.conf").exists());
    }

    #[tokio::test]
    async fn test_add_conflict_transition_scenario() {
        let (_dir, service) = file_service().await;

        let added = service.add("192.168.1.10", "block").await.unwrap();
        assert_eq!(added.id, 1);
        assert_eq!(directive_lines(&service).await, vec!["deny 192.168.1.10;".to_string()]);

        let err = service.add("192.168.1.10", "allow").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(directive_lines(&service).await, vec!["deny 192.168.1.10;".to_string()]);

        let switched = service.set_action("192.168.1.10", "allow").await.unwrap();
        assert_eq!(switched.action, RuleAction::Allow);
        assert_eq!(switched.origin_type, OriginType::Manual);
        assert_eq!(switched.date_added, added.date_added);
        assert_eq!(directive_lines(&service).await, vec!["allow 192.168.1.10;".to_string()]);
    }

    #[tokio::test]
    async fn test_block_then_allow_keeps_provenance() {
        let (_dir, service) = file_service().await;
        let stamp = Utc::now() - chrono::Duration::days(3);
        let added = service
            .add_rule("198.51.100.9", RuleAction::Allow, OriginType::Malicious, stamp)
            .await
            .unwrap();

        service.set_action("198.51.100.9", "block").await.unwrap();
        let final_rule = service.set_action("198.51.100.9", "allow").await.unwrap();

        assert_eq!(final_rule.action, RuleAction::Allow);
        assert_eq!(final_rule.origin_type, added.origin_type);
        assert_eq!(final_rule.date_added, added.date_added);
    }

    #[tokio::test]
    async fn test_directive_tracks_store_after_mixed_operations() {
        let (_dir, service) = file_service().await;

        service.add("10.0.0.1", "block").await.unwrap();
        service.add("10.0.0.12", "allow").await.unwrap();
        service.add("10.0.0.2", "block").await.unwrap();
        service.set_action("10.0.0.1", "allow").await.unwrap();
        service.delete("10.0.0.2").await.unwrap();
        service.set_action("10.0.0.12", "block").await.unwrap();

        let mut lines = directive_lines(&service).await;
        lines.sort();
        assert_eq!(lines, vec!["allow 10.0.0.1;".to_string(), "deny 10.0.0.12;".to_string()]);

        let stored = service.repository().list().await.unwrap();
        assert_eq!(stored.len(), lines.len());
        for rule in stored {
            let expected = format!("{} {};", rule.action.directive_keyword(), rule.ip_address);
            assert!(lines.contains(&expected));
        }
    }

    #[tokio::test]
    async fn test_add_replaces_stale_directive_line() {
        let (dir, service) = file_service().await;
        std::fs::write(dir.path().join("ips.conf"), "deny 10.0.0.1;\nallow 172.16.0.1;\n").unwrap();

        service.add("10.0.0.1", "allow").await.unwrap();

        assert_eq!(
            directive_lines(&service).await,
            vec!["allow 172.16.0.1;".to_string(), "allow 10.0.0.1;".to_string()]
        );
    }

    #[tokio::test]
    async fn test_set_action_rejects_directive_keyword() {
        let (_dir, service) = file_service().await;
        service.add("10.0.0.1", "allow").await.unwrap();

        assert_eq!(service.set_action("10.0.0.1", "deny").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(service.add("10.0.0.2", "deny").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(directive_lines(&service).await, vec!["allow 10.0.0.1;".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_transition_leaves_store_and_directive() {
        let dir = tempdir().unwrap();
        let repository = Arc::new(MemoryRepository::default());
        let service = RuleService::new(repository.clone(), DirectiveFile::new(dir.path().join("ips.conf")), 10);
        service.add("10.0.0.1", "block").await.unwrap();

        repository.fail_next_write.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = service.set_action("10.0.0.1", "allow").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);

        assert_eq!(service.get("10.0.0.1").await.unwrap().unwrap().action, RuleAction::Block);
        assert_eq!(directive_lines(&service).await, vec!["deny 10.0.0.1;".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_dir, service) = file_service().await;
        service.add("10.0.0.1", "block").await.unwrap();

        let err = service.delete("10.0.0.9").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(directive_lines(&service).await.len(), 1);
        assert!(service.get("10.0.0.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_action_missing_is_not_found() {
        let (_dir, service) = file_service().await;
        let err = service.set_action("10.0.0.9", "allow").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(directive_lines(&service).await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (_dir, service) = file_service().await;
        assert_eq!(service.add("", "block").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(service.add("10.0.0.256", "block").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(service.add("10.0.0.1", "").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(service.add("10.0.0.1", "drop").await.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(service.clear("everything").await.unwrap_err().kind(), ErrorKind::Validation);
        assert!(service.repository().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_rules_and_lines() {
        let (_dir, service) = file_service().await;
        let now = Utc::now();
        service.add("10.0.0.1", "allow").await.unwrap();
        service.add_rule("10.0.0.2", RuleAction::Block, OriginType::Malicious, now).await.unwrap();
        service.add_rule("10.0.0.3", RuleAction::Block, OriginType::Malicious, now).await.unwrap();

        assert_eq!(service.clear("malicious").await.unwrap(), 2);
        assert_eq!(directive_lines(&service).await, vec!["allow 10.0.0.1;".to_string()]);
        assert_eq!(service.clear("malicious").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_pages_and_filters() {
        let (_dir, service) = file_service().await;
        let now = Utc::now();
        for i in 1..=25 {
            service
                .add_rule(&format!("10.0.0.{}", i), RuleAction::Block, OriginType::Automatic, now)
                .await
                .unwrap();
        }
        service.add("192.168.0.1", "allow").await.unwrap();

        let first = service.list(1, "all").await.unwrap();
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.rules[0].ip_address, "192.168.0.1");

        let manual = service.list(1, "manual").await.unwrap();
        assert_eq!(manual.rules.len(), 1);
        assert_eq!(manual.total_pages, 1);

        let automatic = service.list(3, "automatic").await.unwrap();
        assert_eq!(automatic.rules.len(), 5);
        assert_eq!(automatic.total_pages, 3);

        assert!(service.list(1, "malicious").await.unwrap().rules.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_repairs_directive_file() {
        let (dir, service) = file_service().await;
        service.add("10.0.0.1", "block").await.unwrap();
        service.add("10.0.0.2", "allow").await.unwrap();

        std::fs::write(dir.path().join("ips.conf"), "deny 10.0.0.1;\ndeny 10.0.0.1;\n").unwrap();

        assert_eq!(service.reconcile().await.unwrap(), 2);
        let mut lines = directive_lines(&service).await;
        lines.sort();
        assert_eq!(lines, vec!["allow 10.0.0.2;".to_string(), "deny 10.0.0.1;".to_string()]);
    }

    #[tokio::test]
    async fn test_directive_failure_is_reported_separately() {
        let dir = tempdir().unwrap();
        // ディレクトリをファイルパスとして渡し、追記を失敗させる
        let directive = DirectiveFile::new(dir.path());
        let service = RuleService::new(Arc::new(MemoryRepository::default()), directive, 10);

        let err = service.add("10.0.0.1", "block").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfSync);
        assert!(matches!(&err, RuleError::DirectiveSync { target, .. } if target == "10.0.0.1"));
        assert!(service.get("10.0.0.1").await.unwrap().is_some());

        let err = service.reconcile().await.unwrap_err();
        assert!(matches!(&err, RuleError::DirectiveSync { target, .. } if target == "全ルールの再生成"));
    }

    #[tokio::test]
    async fn test_concurrent_mutations_keep_one_line_per_address() {
        let (_dir, service) = file_service().await;
        let service = Arc::new(service);
        for i in 1..=10 {
            service.add(&format!("10.0.0.{}", i), "block").await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 1..=10 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let ip = format!("10.0.0.{}", i);
                service.set_action(&ip, "allow").await.unwrap();
                service.set_action(&ip, "block").await.unwrap();
                service.set_action(&ip, "allow").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let lines = directive_lines(&service).await;
        assert_eq!(lines.len(), 10);
        assert!(lines.iter().all(|line| line.starts_with("allow ")));
        assert_eq!(service.repository().list().await.unwrap().len(), 10);
    }

    struct FixedGeo;

    impl GeoLookup for FixedGeo {
        fn lookup(&self, ip: Ipv4Addr) -> Option<GeoLocation> {
            (ip == Ipv4Addr::new(203, 0, 113, 5)).then(|| GeoLocation {
                city: "Tokyo".to_string(),
                country: "Japan".to_string(),
                country_code: "JP".to_string(),
                latitude: 35.68,
                longitude: 139.76,
            })
        }
    }

    #[tokio::test]
    async fn test_geo_lookup_delegates() {
        let (_dir, service) = file_service().await;
        assert_eq!(service.geo_lookup("203.0.113.5").unwrap(), None);

        let service = service.with_geo_lookup(Arc::new(FixedGeo));
        let location = service.geo_lookup("203.0.113.5").unwrap().unwrap();
        assert_eq!(location.country_code, "JP");
        assert_eq!(service.geo_lookup("198.51.100.1").unwrap(), None);
        assert_eq!(service.geo_lookup("not-an-ip").unwrap_err().kind(), ErrorKind::Validation);
    }
}
