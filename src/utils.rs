use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

use crate::CrawlError;

static DEFAULT_URL_REGEX: OnceLock<Regex> = OnceLock::new();

/// The default pattern used to extract absolute URLs from remote source
/// documents.
pub fn default_url_regex() -> &'static Regex {
    DEFAULT_URL_REGEX
        .get_or_init(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("default URL pattern is valid"))
}

/// Normalize a URL into its deduplication form.
///
/// Parsing lowercases the scheme and host and resolves default ports; on
/// top of that the fragment is stripped, query parameters are sorted, and
/// `utm_*` tracking parameters are dropped. Two URLs differing only in
/// those aspects collapse to the same unique key.
pub fn normalize_url(raw: &str) -> Result<String, CrawlError> {
    let trimmed = raw.trim();
    let mut parsed =
        Url::parse(trimmed).map_err(|e| CrawlError::InvalidUrl(format!("{trimmed}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::InvalidUrl(format!(
                "unsupported scheme '{other}': {trimmed}"
            )))
        }
    }

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        parsed.set_query(Some(&query));
    }

    Ok(parsed.to_string())
}

/// Extract URLs from a text document, collapsing duplicates while
/// preserving first-occurrence order.
pub fn extract_urls(text: &str, pattern: &Regex) -> Vec<String> {
    let mut seen = HashSet::new();
    pattern
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.domain().map(|d| d.to_string()))
}

/// Resident memory of this process in bytes, read from the host.
pub fn get_used_memory_bytes() -> Option<u64> {
    // /proc/self/status VmRSS (Linux)
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in content.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(kb) = parts[1].parse::<u64>() {
                    return Some(kb * 1024);
                }
            }
        }
    }
    None
}

/// Total memory of the host in bytes.
pub fn get_total_memory_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(kb) = parts[1].parse::<u64>() {
                    return Some(kb * 1024);
                }
            }
        }
    }
    None
}

/// Aggregate busy/total scheduler ticks across all cores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuTicks {
    pub busy: u64,
    pub total: u64,
}

/// Read the aggregate CPU tick counters from the host.
///
/// Successive readings are diffed by the CPU sampler; a single reading
/// carries no load information on its own.
pub fn read_cpu_ticks() -> Option<CpuTicks> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().next()?;
    if !line.starts_with("cpu ") {
        return None;
    }

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    // idle + iowait count as idle time
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);

    Some(CpuTicks {
        busy: total.saturating_sub(idle),
        total,
    })
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_basic() {
        assert_eq!(
            normalize_url("https://Example.COM/path").unwrap(),
            "https://example.com/path"
        );
        assert_eq!(
            normalize_url("  https://example.com  ").unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_normalize_url_strips_fragment() {
        assert_eq!(
            normalize_url("https://example.com/page#section-2").unwrap(),
            normalize_url("https://example.com/page").unwrap()
        );
    }

    #[test]
    fn test_normalize_url_sorts_query() {
        assert_eq!(
            normalize_url("https://example.com/?b=2&a=1").unwrap(),
            normalize_url("https://example.com/?a=1&b=2").unwrap()
        );
    }

    #[test]
    fn test_normalize_url_drops_tracking_params() {
        assert_eq!(
            normalize_url("https://example.com/?utm_source=feed&x=1").unwrap(),
            normalize_url("https://example.com/?x=1").unwrap()
        );
    }

    #[test]
    fn test_normalize_url_rejects_non_http() {
        assert!(normalize_url("ftp://example.com").is_err());
        assert!(normalize_url("not a url").is_err());
        assert!(normalize_url("").is_err());
    }

    #[test]
    fn test_extract_urls() {
        let text = r#"
            see https://example.com/a and also
            <a href="https://example.com/b">link</a>
            https://example.com/a again
        "#;
        let urls = extract_urls(text, default_url_regex());
        assert_eq!(
            urls,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://sub.example.com/path"),
            Some("sub.example.com".to_string())
        );
        assert_eq!(extract_domain("invalid-url"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
