use std::fmt;

use serde::{Deserialize, Serialize};

/// A single `;name[=value]` parameter as found on URIs, name-addrs and
/// header values.
///
/// Values are stored exactly as received (including any surrounding quotes)
/// so that printing a parsed parameter reproduces the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Param {
            name: name.into(),
            value: value.map(Into::into),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: None,
        }
    }

    /// The value with any surrounding double quotes removed.
    pub fn unquoted_value(&self) -> Option<&str> {
        self.value.as_deref().map(|v| {
            if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                &v[1..v.len() - 1]
            } else {
                v
            }
        })
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split `s` on `sep`, ignoring separators inside double quotes or angle
/// brackets.  Used for parameter lists and comma-separated header values.
pub fn split_quoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            c if c == sep && !in_quotes && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Parse a `;a=1;b;c="x"` parameter tail (leading separator already
/// consumed) into a parameter list.
pub fn parse_params(s: &str) -> Vec<Param> {
    split_quoted(s, ';')
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((n, v)) => Param::new(n.trim(), Some(v.trim())),
            None => Param::flag(p),
        })
        .collect()
}

/// Find a parameter by (case-insensitive) name.
pub fn find_param<'a>(params: &'a [Param], name: &str) -> Option<&'a Param> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Replace or insert a parameter.
pub fn set_param(params: &mut Vec<Param>, name: &str, value: Option<&str>) {
    match params.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
        Some(p) => p.value = value.map(str::to_string),
        None => params.push(Param::new(name, value)),
    }
}

/// Remove a parameter by name, returning whether it was present.
pub fn remove_param(params: &mut Vec<Param>, name: &str) -> bool {
    let before = params.len();
    params.retain(|p| !p.name.eq_ignore_ascii_case(name));
    params.len() != before
}

/// Print a parameter list as a `;`-joined tail (with leading `;` when
/// non-empty).
pub fn fmt_params(params: &[Param]) -> String {
    let mut out = String::new();
    for p in params {
        out.push(';');
        out.push_str(&p.to_string());
    }
    out
}
