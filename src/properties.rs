//! Cache directories describe themselves with small `key=value`
//! property files (`cache.properties`, `file-access.properties`).
//! Keys and values are escaped so that any string round-trips; files
//! are published atomically, so readers never see a partial write.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::benign_error::is_absent_file_error;
use crate::error::Result;

pub type Properties = BTreeMap<String, String>;

fn escape(out: &mut String, text: &str, is_key: bool) {
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' => {
                out.push('\\');
                out.push(c);
            }
            // Leading spaces would be trimmed, and in keys any space
            // would end the key.
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            '#' | '!' if is_key && i == 0 => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

/// Returns the byte offset of the first unescaped `=` or `:` in `line`.
fn find_separator(line: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '=' || c == ':' {
            return Some(i);
        }
    }

    None
}

/// Drops trailing unescaped spaces from `key`.
fn trim_padding(key: &str) -> &str {
    let mut end = 0;
    let mut escaped = false;
    for (i, c) in key.char_indices() {
        if escaped || c != ' ' {
            end = i + c.len_utf8();
        }
        escaped = !escaped && c == '\\';
    }

    &key[..end]
}

pub fn parse(text: &str) -> Properties {
    let mut properties = Properties::new();

    for line in text.lines() {
        let line = line.trim_start_matches(' ');
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let (key, value) = match find_separator(line) {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };

        properties.insert(
            unescape(trim_padding(key)),
            unescape(value.trim_start_matches(' ')),
        );
    }

    properties
}

pub fn format(properties: &Properties) -> String {
    let mut out = String::new();

    for (key, value) in properties {
        escape(&mut out, key, true);
        out.push('=');
        escape(&mut out, value, false);
        out.push('\n');
    }

    out
}

/// Reads the properties file at `path`, or `None` if there is no such
/// file.
pub fn load(path: &Path) -> Result<Option<Properties>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(parse(&text))),
        Err(e) if is_absent_file_error(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replaces the file at `path` with `properties`.
pub fn store(path: &Path, properties: &Properties) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(format(properties).as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[test]
fn test_parse_plain_lines() {
    let properties = parse("# comment\n\na=1\nb = two words\n  c:3\nflag\n");

    assert_eq!(properties.len(), 4);
    assert_eq!(properties["a"], "1");
    assert_eq!(properties["b"], "two words");
    assert_eq!(properties["c"], "3");
    assert_eq!(properties["flag"], "");
}

#[test]
fn test_format_escapes_separators() {
    let mut properties = Properties::new();
    properties.insert("path=with:colons".to_owned(), " leading\nnewline\\".to_owned());

    let text = format(&properties);
    assert_eq!(text, "path\\=with\\:colons=\\ leading\\nnewline\\\\\n");
    assert_eq!(parse(&text), properties);
}

#[test]
fn test_store_and_load() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let path = temp.path("cache/cache.properties");

    assert_eq!(load(&path).expect("load must succeed"), None);

    let mut properties = Properties::new();
    properties.insert("version".to_owned(), "1".to_owned());
    store(&path, &properties).expect("store must succeed");
    assert_eq!(load(&path).expect("load must succeed"), Some(properties.clone()));

    properties.insert("version".to_owned(), "2".to_owned());
    store(&path, &properties).expect("store must succeed");
    assert_eq!(load(&path).expect("load must succeed"), Some(properties));

    // No temporary files left behind.
    let entries = std::fs::read_dir(temp.path("cache"))
        .expect("read_dir must succeed")
        .count();
    assert_eq!(entries, 1);
}

#[cfg(test)]
mod test {
    use proptest::collection::btree_map;
    use proptest::prelude::*;

    proptest! {
        /// Whatever the keys and values contain, a formatted file
        /// parses back to the same map.
        #[test]
        fn test_format_parse_identity(properties in btree_map(".+", ".*", 0..8usize)) {
            let text = super::format(&properties);
            prop_assert_eq!(super::parse(&text), properties);
        }
    }
}
