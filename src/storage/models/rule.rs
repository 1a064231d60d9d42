use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use postgres_types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::core::error::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginType {
    Manual,
    Automatic,
    Malicious,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "block",
        }
    }

    /// ディレクティブファイルに書くキーワード
    pub fn directive_keyword(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Block => "deny",
        }
    }

    /// 保存済みデータの読み込み用。旧形式の "deny" も受け付ける
    pub fn from_stored(s: &str) -> Result<Self, RuleError> {
        if s.trim().eq_ignore_ascii_case("deny") {
            return Ok(RuleAction::Block);
        }
        s.parse()
    }
}

impl OriginType {
    pub const ALL: [OriginType; 3] = [OriginType::Manual, OriginType::Automatic, OriginType::Malicious];

    pub fn as_str(&self) -> &'static str {
        match self {
            OriginType::Manual => "manual",
            OriginType::Automatic => "automatic",
            OriginType::Malicious => "malicious",
        }
    }

    pub fn from_stored(s: &str) -> Result<Self, RuleError> {
        s.parse()
    }
}

impl FromStr for RuleAction {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(RuleAction::Allow),
            "block" => Ok(RuleAction::Block),
            _ => Err(RuleError::Validation(format!("無効なアクション: {}", s))),
        }
    }
}

impl FromStr for OriginType {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(OriginType::Manual),
            "automatic" => Ok(OriginType::Automatic),
            "malicious" => Ok(OriginType::Malicious),
            _ => Err(RuleError::Validation(format!("無効な追加種別: {}", s))),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OriginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                <$ty>::from_stored(&raw).map_err(serde::de::Error::custom)
            }
        }

        impl ToSql for $ty {
            fn to_sql(
                &self,
                ty: &Type,
                out: &mut BytesMut,
            ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
                self.as_str().to_sql(ty, out)
            }

            accepts!(TEXT, VARCHAR);
            to_sql_checked!();
        }

        impl<'a> FromSql<'a> for $ty {
            fn from_sql(
                ty: &Type,
                raw: &'a [u8],
            ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
                let value = <&str as FromSql>::from_sql(ty, raw)?;
                Ok(<$ty>::from_stored(value)?)
            }

            accepts!(TEXT, VARCHAR);
        }
    };
}

string_serde!(RuleAction);
string_serde!(OriginType);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    #[serde(alias = "Id", alias = "ID")]
    pub id: i64,
    #[serde(alias = "IpAddress", alias = "ipaddress", alias = "IP")]
    pub ip_address: String,
    #[serde(alias = "Action")]
    pub action: RuleAction,
    #[serde(alias = "DateAdded", alias = "dateadded", with = "date_format")]
    pub date_added: DateTime<Utc>,
    #[serde(alias = "addType", alias = "AddType", alias = "OriginType")]
    pub origin_type: OriginType,
}

/// ストアに渡す新規ルール。idはストア側で採番する
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub ip_address: String,
    pub action: RuleAction,
    pub origin_type: OriginType,
    pub date_added: DateTime<Utc>,
}

impl NewRule {
    pub fn new(ip_address: impl Into<String>, action: RuleAction, origin_type: OriginType, date_added: DateTime<Utc>) -> Self {
        Self {
            ip_address: ip_address.into(),
            action,
            origin_type,
            date_added,
        }
    }

    pub fn into_record(self, id: i64) -> RuleRecord {
        RuleRecord {
            id,
            ip_address: self.ip_address,
            action: self.action,
            date_added: self.date_added,
            origin_type: self.origin_type,
        }
    }
}

impl RuleRecord {
    /// 同じ追加種別と追加日時を引き継いだまま、アクションだけ差し替える
    pub fn with_action(&self, action: RuleAction) -> NewRule {
        NewRule {
            ip_address: self.ip_address.clone(),
            action,
            origin_type: self.origin_type,
            date_added: self.date_added,
        }
    }

    pub fn directive_line(&self) -> String {
        format!("{} {};", self.action.directive_keyword(), self.ip_address)
    }
}

/// manualを先頭に、残りは追加種別の文字列順、同じ種別内はid順
pub fn compare_rules(a: &RuleRecord, b: &RuleRecord) -> Ordering {
    let tier = |r: &RuleRecord| if r.origin_type == OriginType::Manual { 0 } else { 1 };
    tier(a)
        .cmp(&tier(b))
        .then_with(|| a.origin_type.as_str().cmp(b.origin_type.as_str()))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn order_rules(rules: &mut [RuleRecord]) {
    rules.sort_by(compare_rules);
}

mod date_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

/// RFC 3339を優先し、オフセットの無い古い形式はUTCとして読む
pub fn parse_date(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("無効な日時: {} ({})", raw, e))
}
