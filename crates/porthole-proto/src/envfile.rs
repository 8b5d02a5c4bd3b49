//! Key-value configuration files.
//!
//! Both binaries accept a config file of `KEY=value` lines, the same names
//! as the environment variables minus the prefix. `#` comments and blank
//! lines are ignored; values may be quoted.

use std::collections::HashMap;

/// Parse `KEY=value` lines into a map. Later keys win.
pub fn parse(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        out.insert(key, value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_pairs() {
        let map = parse("HUB_URL=https://t.example.com\nSECRET=hunter2\n");
        assert_eq!(map.get("HUB_URL").map(String::as_str), Some("https://t.example.com"));
        assert_eq!(map.get("SECRET").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn skips_comments_and_blanks() {
        let map = parse("# comment\n\n  \nKEY=1\n# KEY=2\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("KEY").map(String::as_str), Some("1"));
    }

    #[test]
    fn trims_and_unquotes() {
        let map = parse("  A = spaced out  \nB=\"quoted value\"\nC='single'\n");
        assert_eq!(map.get("A").map(String::as_str), Some("spaced out"));
        assert_eq!(map.get("B").map(String::as_str), Some("quoted value"));
        assert_eq!(map.get("C").map(String::as_str), Some("single"));
    }

    #[test]
    fn later_keys_win() {
        let map = parse("K=1\nK=2\n");
        assert_eq!(map.get("K").map(String::as_str), Some("2"));
    }

    #[test]
    fn ignores_lines_without_equals() {
        let map = parse("not a pair\nK=v\n");
        assert_eq!(map.len(), 1);
    }
}
