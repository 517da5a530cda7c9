//! Reader for the `key = value` stanzas used by control files and instance
//! configuration. Comment character is `#`, values may be single-quoted,
//! `-` and `_` in keys are interchangeable.

use std::fs;

use anyhow::{anyhow, Context};
use camino::Utf8Path;

/// One parsed `key = value` line. The value has surrounding single quotes
/// stripped; the key is kept as written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvOption {
    pub key: String,
    pub value: String,
}

/// Compare keys treating `-` and `_` as the same character.
pub fn key_matches(key: &str, expected: &str) -> bool {
    key.len() == expected.len()
        && key
            .chars()
            .zip(expected.chars())
            .all(|(a, b)| a == b || (a == '_' && b == '-') || (a == '-' && b == '_'))
}

/// Parse stanza text. Unparseable lines are reported to the caller as
/// `Err` entries so it can decide between warning and failing.
pub fn parse_kv_text(text: &str) -> Vec<Result<KvOption, String>> {
    let mut options = Vec::new();

    for raw_line in text.lines() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            options.push(Err(raw_line.to_string()));
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value = &value[1..value.len() - 1];
        }
        if key.is_empty() {
            options.push(Err(raw_line.to_string()));
            continue;
        }
        options.push(Ok(KvOption {
            key: key.to_string(),
            value: value.to_string(),
        }));
    }

    options
}

/// Read and parse a stanza file. Open or read failure is fatal for the
/// caller.
pub fn read_kv_file(path: &Utf8Path) -> anyhow::Result<Vec<Result<KvOption, String>>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Cannot read file {path:?}"))?;
    Ok(parse_kv_text(&text))
}

pub fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(anyhow!("invalid boolean \"{other}\"")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stanza_with_sections_and_quotes() {
        let text = "#Configuration\n\
                    backup-mode = full\n\
                    stream = false\n\
                    \n\
                    start-time = '2019-08-24 20:48:44+03'\n\
                    status = OK # trailing comment\n";
        let options: Vec<_> = parse_kv_text(text).into_iter().map(Result::unwrap).collect();
        assert_eq!(options.len(), 4);
        assert_eq!(options[0].key, "backup-mode");
        assert_eq!(options[0].value, "full");
        assert_eq!(options[2].value, "2019-08-24 20:48:44+03");
        assert_eq!(options[3].value, "OK");
    }

    #[test]
    fn reports_garbage_lines() {
        let parsed = parse_kv_text("no equals sign here\nkey = ok\n");
        assert!(parsed[0].is_err());
        assert!(parsed[1].is_ok());
    }

    #[test]
    fn key_matching_folds_dash_and_underscore() {
        assert!(key_matches("primary_conninfo", "primary-conninfo"));
        assert!(key_matches("primary-conninfo", "primary-conninfo"));
        assert!(!key_matches("primary-conninfo", "primary-conninf"));
    }

    #[test]
    fn bool_tokens() {
        assert!(parse_bool("true").unwrap());
        assert!(!parse_bool("false").unwrap());
        parse_bool("on").unwrap_err();
    }
}
