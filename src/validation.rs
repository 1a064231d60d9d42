use crate::core::error::{RuleError, RuleResult};

/// ドット区切り4オクテットのIPv4アドレスか検証する
pub fn validate_ipv4(ip: &str) -> RuleResult<()> {
    if is_valid_ipv4(ip) {
        Ok(())
    } else if ip.trim().is_empty() {
        Err(RuleError::Validation("IPアドレスは必須です".to_string()))
    } else {
        Err(RuleError::Validation(format!("無効なIPアドレス形式: {}", ip)))
    }
}

pub fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    parts.len() == 4 && parts.iter().all(|part| is_valid_octet(part))
}

fn is_valid_octet(part: &str) -> bool {
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    // 先頭ゼロは8進数と解釈する実装があるため拒否する
    if part.len() > 1 && part.starts_with('0') {
        return false;
    }
    part.parse::<u16>().map(|value| value <= 255).unwrap_or(false)
}
