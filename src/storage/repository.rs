// src/storage/repository.rs
use async_trait::async_trait;

use crate::core::error::{RuleError, RuleResult};
use crate::storage::models::rule::{order_rules, NewRule, OriginType, RuleAction, RuleRecord};

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// 新規ルールを保存する。同じIPが存在すれば `AlreadyExists`
    async fn add(&self, rule: NewRule) -> RuleResult<RuleRecord>;

    /// ルールを削除して削除したレコードを返す。存在しなければ `NotFound`
    async fn delete(&self, ip: &str) -> RuleResult<RuleRecord>;

    async fn get(&self, ip: &str) -> RuleResult<Option<RuleRecord>>;

    /// 全レコードを順不同で返す。並び順は `list` が決める
    async fn load_all(&self) -> RuleResult<Vec<RuleRecord>>;

    /// 指定した追加種別のルールを一括削除する
    async fn clear_origin(&self, origin: OriginType) -> RuleResult<Vec<RuleRecord>>;

    /// 削除→再追加でアクションを切り替える。追加種別と追加日時は引き継ぐ。
    ///
    /// 実装は一連の操作を1つのロックまたはトランザクションの中で行い、
    /// 途中でアドレスが消えた状態を他の呼び出しに見せてはならない。
    async fn transition(&self, ip: &str, action: RuleAction) -> RuleResult<RuleRecord>;

    fn backend_name(&self) -> &'static str;

    async fn list(&self) -> RuleResult<Vec<RuleRecord>> {
        let mut rules = self.load_all().await?;
        order_rules(&mut rules);
        Ok(rules)
    }
}

/// 切り替え後に保存するルールを決める。
///
/// 対象が無ければ `NotFound`、既に同じアクションなら `None` (変更不要)。
pub fn plan_transition(ip: &str, current: Option<&RuleRecord>, action: RuleAction) -> RuleResult<Option<NewRule>> {
    let current = current.ok_or_else(|| RuleError::NotFound(ip.to_string()))?;
    if current.action == action {
        return Ok(None);
    }
    Ok(Some(current.with_action(action)))
}
