use std::collections::BTreeMap;

/// Split a list value on commas and whitespace, dropping empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a `key=value` pair as given to `--ansible-var` or `--terraform-var`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Parse space separated `k=v` pairs as stored in config files.
///
/// Values holding blanks or quotes are single quoted, `'\''` inside a quoted
/// value stands for a literal quote.
pub fn parse_key_values(value: &str) -> Result<BTreeMap<String, String>, String> {
    split_words(value)?
        .iter()
        .map(|word| parse_key_value(word))
        .collect()
}

pub fn join_key_values(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, quote_word(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_word(word: &str) -> String {
    if word
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'))
    {
        format!("'{}'", word.replace('\'', "'\\''"))
    } else {
        word.to_owned()
    }
}

/// Split on unquoted whitespace. Single quotes are literal, double quotes
/// and bare words accept backslash escapes.
fn split_words(value: &str) -> Result<Vec<String>, String> {
    let mut words = vec![];
    let mut word: Option<String> = None;
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                words.extend(word.take());
            },
            '\'' => {
                let current = word.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated single quote in '{}'", value)),
                    }
                }
            },
            '"' => {
                let current = word.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => current.push(c),
                            None => return Err(format!("unterminated escape in '{}'", value)),
                        },
                        Some(c) => current.push(c),
                        None => return Err(format!("unterminated double quote in '{}'", value)),
                    }
                }
            },
            '\\' => match chars.next() {
                Some(c) => word.get_or_insert_with(String::new).push(c),
                None => return Err(format!("unterminated escape in '{}'", value)),
            },
            c => word.get_or_insert_with(String::new).push(c),
        }
    }
    words.extend(word);
    Ok(words)
}
