use serde::Serialize;

use crate::storage::models::rule::{OriginType, RuleRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RuleFilter {
    #[default]
    All,
    Origin(OriginType),
    /// 既知の追加種別に当てはまらないトークン。何も選択しない
    Unmatched(String),
}

impl RuleFilter {
    pub fn from_token(token: &str) -> Self {
        if token.trim().eq_ignore_ascii_case("all") {
            return RuleFilter::All;
        }
        match token.parse::<OriginType>() {
            Ok(origin) => RuleFilter::Origin(origin),
            Err(_) => RuleFilter::Unmatched(token.to_string()),
        }
    }

    pub fn matches(&self, rule: &RuleRecord) -> bool {
        match self {
            RuleFilter::All => true,
            RuleFilter::Origin(origin) => rule.origin_type == *origin,
            RuleFilter::Unmatched(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePage {
    pub rules: Vec<RuleRecord>,
    pub total_pages: usize,
}

/// 総ページ数。0件でも1ページとして扱う
pub fn total_pages(count: usize, page_size: usize) -> usize {
    let page_size = page_size.max(1);
    count.div_ceil(page_size).max(1)
}

/// 1始まりのページ番号で絞り込み済みの一覧を切り出す
pub fn page(rules: &[RuleRecord], page: usize, page_size: usize, filter: &RuleFilter) -> RulePage {
    let page = page.max(1);
    let page_size = page_size.max(1);

    let filtered: Vec<&RuleRecord> = rules.iter().filter(|rule| filter.matches(rule)).collect();
    let total_pages = total_pages(filtered.len(), page_size);

    let rules = filtered
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .cloned()
        .collect();

    RulePage { rules, total_pages }
}
