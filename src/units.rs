//! Byte-size parsing and formatting shared by labels, status and reports.

const BINARY_ABBRS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("invalid size: {0:?}")]
    InvalidSize(String),
    #[error("invalid quantity: {0:?}")]
    InvalidQuantity(String),
}

/// Format a byte count with binary units and four significant digits, e.g. `2GiB`, `1.5MiB`.
pub fn bytes_size(size: f64) -> String {
    let mut size = size;
    let mut i = 0;
    while size >= 1024.0 && i < BINARY_ABBRS.len() - 1 {
        size /= 1024.0;
        i += 1;
    }
    format!("{}{}", format_significant(size, 4), BINARY_ABBRS[i])
}

fn format_significant(v: f64, digits: i32) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    let exp = v.abs().log10().floor() as i32;
    if exp < -4 || exp >= digits {
        return format!("{:.*e}", (digits - 1) as usize, v);
    }
    let decimals = (digits - 1 - exp).max(0) as usize;
    let s = format!("{:.*}", decimals, v);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Parse a human readable size such as `2GiB`, `1.50 GB` or `512B`.
/// Decimal-looking suffixes are read as binary multiples, the way the cache engine reports them.
pub fn parse_human_size(s: &str) -> Result<u64, UnitsError> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (num, unit) = trimmed.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| UnitsError::InvalidSize(s.to_string()))?;
    let unit = unit.trim().to_ascii_lowercase();
    let unit = unit.strip_suffix("ib").or_else(|| unit.strip_suffix('b')).unwrap_or(&unit);
    let shift = match unit {
        "" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        "p" => 50,
        _ => return Err(UnitsError::InvalidSize(s.to_string())),
    };
    Ok((value * (1u64 << shift) as f64).round() as u64)
}

/// Parse a Kubernetes resource quantity (`2Gi`, `500M`, `1024`) into bytes.
pub fn parse_quantity(s: &str) -> Result<u64, UnitsError> {
    let invalid = || UnitsError::InvalidQuantity(s.to_string());
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (num, suffix) = trimmed.split_at(split);
    let value: f64 = num.parse().map_err(|_| invalid())?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return Err(invalid()),
    };
    if value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_binary_sizes() {
        assert_eq!(bytes_size(0.0), "0B");
        assert_eq!(bytes_size(512.0), "512B");
        assert_eq!(bytes_size(2.0 * 1024.0 * 1024.0 * 1024.0), "2GiB");
        assert_eq!(bytes_size(1536.0 * 1024.0), "1.5MiB");
        assert_eq!(bytes_size(1_000_000.0), "976.6KiB");
    }

    #[test]
    fn parses_reported_sizes() {
        assert_eq!(parse_human_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_human_size("2.00GB").unwrap(), 2 << 30);
        assert_eq!(parse_human_size("0B").unwrap(), 0);
        assert_eq!(parse_human_size("1.5 MB").unwrap(), 3 << 19);
        assert!(parse_human_size("lots").is_err());
    }

    #[test]
    fn parses_quantities() {
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 << 30);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("1024").unwrap(), 1024);
        assert!(parse_quantity("1Xi").is_err());
    }
}
