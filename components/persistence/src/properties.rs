//! Text format of the manifest: one `key=value` pair per line.
//!
//! Lines starting with `#` or `!` are comments. Separators and backslashes inside keys or values are
//! escaped with a backslash, line breaks are written as `\n`.

use std::collections::BTreeMap;

use crate::error::PersistenceError;

pub type Properties = BTreeMap<String, String>;

pub fn encode(properties: &Properties) -> String {
    let mut text = String::new();
    for (key, value) in properties {
        escape_into(key, &mut text);
        text.push('=');
        escape_into(value, &mut text);
        text.push('\n');
    }
    text
}

pub fn decode(text: &str) -> Result<Properties, PersistenceError> {
    let mut properties = Properties::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            let c = match c {
                '\\' => match chars.next() {
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some('t') => '\t',
                    Some(escaped) => escaped,
                    None => {
                        return Err(PersistenceError::DataCorrupted(format!(
                            "dangling escape at manifest line {}",
                            index + 1
                        )))
                    }
                },
                '=' | ':' if !in_value => {
                    in_value = true;
                    continue;
                }
                c if in_value && value.is_empty() && c.is_whitespace() => continue,
                c => c,
            };
            if in_value {
                value.push(c);
            } else {
                key.push(c);
            }
        }
        properties.insert(key.trim_end().to_owned(), value);
    }
    Ok(properties)
}

fn escape_into(s: &str, out: &mut String) {
    for (i, c) in s.chars().enumerate() {
        match c {
            ' ' | '\t' if i == 0 => {
                out.push('\\');
                out.push(c);
            }
            '\\' | '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
}
