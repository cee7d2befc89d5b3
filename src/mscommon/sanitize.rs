//! 落库前的数据清洗模块
//!
//! 文本去除空字节与控制字符、浮点数NaN/Inf归零、URL与发布时间校验。
//! 清洗发生在保存路径上，打分路径使用原始文本。

use chrono::{Datelike, TimeZone, Utc};
use tracing::{info, warn};

/// 保存路径日志目标
pub const NEWSSAVING_TARGET: &str = "NEWSSAVING";

/// 文本字段长度上限
pub const MAX_HEADLINE_LEN: usize = 500;
pub const MAX_SUMMARY_LEN: usize = 2000;
pub const MAX_URL_LEN: usize = 500;

/// 清洗文本：去除空字节与控制字符（保留\t \n \r），折叠空白，截断到上限
pub fn sanitize_text(text: &str, field_name: &str, max_length: usize) -> String {
    let original_length = text.len();
    let mut issues: Vec<&str> = Vec::new();

    if text.contains('\0') {
        issues.push("null_bytes");
    }

    // 制表符/换行/回车之外的控制字符（含DEL与C1区）一律去除
    let cleaned: String = text
        .chars()
        .filter(|&c| c == '\t' || c == '\n' || c == '\r' || !c.is_control())
        .collect();
    if cleaned.len() != text.len() && !issues.contains(&"null_bytes") {
        issues.push("control_chars");
    }

    // 折叠连续空白为单个空格
    let mut normalized = String::with_capacity(cleaned.len());
    let mut last_was_space = false;
    for c in cleaned.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                normalized.push(' ');
            }
            last_was_space = true;
        } else {
            normalized.push(c);
            last_was_space = false;
        }
    }
    let mut result = normalized.trim().to_string();

    if result.chars().count() > max_length {
        result = result.chars().take(max_length).collect();
        issues.push("truncated");
    }

    if !issues.is_empty() {
        info!(
            target: NEWSSAVING_TARGET,
            field = field_name,
            issues = issues.join(","),
            original_len = original_length,
            final_len = result.len(),
            "字段已清洗"
        );
    }

    result
}

/// 校验浮点数：NaN/Inf归为默认值，超出范围则截断
pub fn safe_float(value: f64, field_name: &str, default: f64, min_val: f64, max_val: f64) -> f64 {
    if value.is_nan() {
        warn!(target: NEWSSAVING_TARGET, field = field_name, "值为NaN，使用默认值 {}", default);
        return default;
    }
    if value.is_infinite() {
        warn!(target: NEWSSAVING_TARGET, field = field_name, "值为Infinity，使用默认值 {}", default);
        return default;
    }
    if value < min_val || value > max_val {
        let clamped = value.clamp(min_val, max_val);
        warn!(
            target: NEWSSAVING_TARGET,
            field = field_name,
            raw = value,
            clamped,
            "值超出范围，已截断"
        );
        return clamped;
    }
    value
}

/// 通用浮点清洗：NaN/Inf归零，±1e10之外截断
pub fn coerce_float(value: f64) -> f64 {
    safe_float(value, "float", 0.0, -1e10, 1e10)
}

/// 清洗URL：去空字节、空格转%20、截断，并要求可打印
pub fn safe_url(url: &str, max_length: usize) -> String {
    let mut cleaned = url.trim().replace('\0', "").replace(' ', "%20");
    cleaned.retain(|c| !c.is_control());
    if cleaned.len() > max_length {
        cleaned.truncate(max_length);
        info!(
            target: NEWSSAVING_TARGET,
            original_len = url.len(),
            final_len = cleaned.len(),
            "URL已截断"
        );
    }
    cleaned
}

/// 校验发布时间（毫秒）：年份必须落在[1900, 2100]，否则用当前时间
pub fn validate_publish_time_ms(publish_time_ms: i64, now_ms: i64) -> i64 {
    match Utc.timestamp_millis_opt(publish_time_ms).single() {
        Some(dt) if (1900..=2100).contains(&dt.year()) => publish_time_ms,
        _ => {
            warn!(
                target: NEWSSAVING_TARGET,
                raw = publish_time_ms,
                "发布时间超出年份范围[1900, 2100]，使用当前时间"
            );
            now_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_removes_null_bytes_and_control_chars() {
        let dirty = "Fed\0 cuts\x01 rates\x1f again";
        let clean = sanitize_text(dirty, "headline", MAX_HEADLINE_LEN);
        assert_eq!(clean, "Fed cuts rates again");
        assert!(!clean.contains('\0'));
    }

    #[test]
    fn test_sanitize_removes_del_and_c1_control_chars() {
        // DEL (U+007F) 与C1区 (U+0080-U+009F) 同属控制字符
        let dirty = "Fed\u{7f} cuts\u{85} rates\u{9f} again";
        let clean = sanitize_text(dirty, "headline", MAX_HEADLINE_LEN);
        assert_eq!(clean, "Fed cuts rates again");
        assert!(clean.chars().all(|c| !c.is_control()));
    }

    #[test]
    fn test_sanitize_keeps_tab_newline_but_normalizes() {
        let clean = sanitize_text("a\tb\nc", "summary", MAX_SUMMARY_LEN);
        // 制表符与换行保留为合法字符后被空白折叠吸收
        assert_eq!(clean, "a b c");
    }

    #[test]
    fn test_sanitize_collapses_whitespace_and_trims() {
        let clean = sanitize_text("  lots   of    spaces  ", "headline", MAX_HEADLINE_LEN);
        assert_eq!(clean, "lots of spaces");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(600);
        let clean = sanitize_text(&long, "headline", MAX_HEADLINE_LEN);
        assert_eq!(clean.chars().count(), MAX_HEADLINE_LEN);
    }

    #[test]
    fn test_safe_float_nan_inf() {
        assert_eq!(safe_float(f64::NAN, "x", 0.0, -100.0, 100.0), 0.0);
        assert_eq!(safe_float(f64::INFINITY, "x", 0.0, -100.0, 100.0), 0.0);
        assert_eq!(safe_float(f64::NEG_INFINITY, "x", 0.0, -100.0, 100.0), 0.0);
    }

    #[test]
    fn test_safe_float_clamps() {
        assert_eq!(safe_float(250.0, "x", 0.0, -100.0, 100.0), 100.0);
        assert_eq!(safe_float(-250.0, "x", 0.0, -100.0, 100.0), -100.0);
        assert_eq!(safe_float(42.5, "x", 0.0, -100.0, 100.0), 42.5);
    }

    #[test]
    fn test_coerce_float_huge_values() {
        assert_eq!(coerce_float(1e12), 1e10);
        assert_eq!(coerce_float(-1e12), -1e10);
    }

    #[test]
    fn test_safe_url() {
        let url = safe_url(" https://example.com/a b\0c ", MAX_URL_LEN);
        assert_eq!(url, "https://example.com/a%20bc");
    }

    #[test]
    fn test_validate_publish_time() {
        let now_ms = 1_700_000_000_000;
        assert_eq!(validate_publish_time_ms(1_690_000_000_000, now_ms), 1_690_000_000_000);
        // 公元5138年，超出范围
        assert_eq!(validate_publish_time_ms(99_999_999_999_999, now_ms), now_ms);
        // 1812年
        assert_eq!(validate_publish_time_ms(-4_984_000_000_000, now_ms), now_ms);
    }
}
