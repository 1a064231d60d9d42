use serde::Serialize;
use std::net::Ipv4Addr;

/// 地図表示用の位置情報
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub city: String,
    pub country: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// オフラインの位置情報データベースへの問い合わせ。実装はこのクレートの外にある
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: Ipv4Addr) -> Option<GeoLocation>;
}
