//! Helpers for pulling values out of command-line token lists.

use crate::error::{ConfigError, ConfigResult};

/// Flags that name the workspace or datacard of a combine invocation.
pub const WORKSPACE_FLAGS: [&str; 2] = ["-d", "--datacard"];

/// Remove `flag` and its value from `args`.
///
/// Accepts both `--flag value` and `--flag=value`. Returns the value (if the
/// flag was present with a value) and the remaining tokens in order.
pub fn extract_arg<S: AsRef<str>>(flag: &str, args: &[S]) -> (Option<String>, Vec<String>) {
    let tokens: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    let joined = format!("{flag}=");

    for (idx, token) in tokens.iter().enumerate() {
        if let Some(value) = token.strip_prefix(&joined) {
            let value = value.to_string();
            let mut rest = tokens.clone();
            rest.remove(idx);
            return (Some(value), rest);
        }
        if token == flag {
            let Some(value) = tokens.get(idx + 1).cloned() else {
                break;
            };
            let mut rest = tokens.clone();
            rest.drain(idx..idx + 2);
            return (Some(value), rest);
        }
    }
    (None, tokens)
}

/// First value following any of `flags` (`--flag value` or `--flag=value`).
pub fn flag_value<'a, S: AsRef<str>>(args: &'a [S], flags: &[&str]) -> Option<&'a str> {
    for flag in flags {
        let joined = format!("{flag}=");
        for (idx, token) in args.iter().enumerate() {
            let token = token.as_ref();
            if token == *flag {
                if let Some(value) = args.get(idx + 1) {
                    return Some(value.as_ref());
                }
            } else if let Some(value) = token.strip_prefix(joined.as_str()) {
                return Some(value);
            }
        }
    }
    None
}

/// The workspace path of a combine invocation, given with `-d` or
/// `--datacard`.
pub fn workspace_arg<'a, S: AsRef<str>>(args: &'a [S]) -> ConfigResult<&'a str> {
    flag_value(args, &WORKSPACE_FLAGS).ok_or(ConfigError::MissingWorkspace)
}
