//! Final command-string composition.
//!
//! The pipe strategies hand the kernel a single shell command line; this
//! module owns the escaping contract used to build it. POSIX arguments
//! are single-quote wrapped (embedded quotes become `'\''`) and argv
//! form is prefixed with `exec ` so the wrapping shell is replaced by
//! the child. Windows arguments follow the Microsoft command-line
//! quoting rules with the cmd metacharacters re-encoded so they survive
//! `cmd /V:ON` delayed expansion.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Escape one argument for a POSIX shell.
pub fn escape_posix(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Join a pre-tokenized argument vector into the POSIX command line,
/// escaping each element and prefixing `exec`.
pub fn join_argv_posix(argv: &[String]) -> String {
    let mut out = String::from("exec");
    for arg in argv {
        out.push(' ');
        out.push_str(&escape_posix(arg));
    }
    out
}

/// Escape one argument for cmd.exe.
///
/// NUL bytes cannot cross `CreateProcess` and are replaced with `?`.
/// Backslash runs before the closing quote are doubled, and the cmd
/// metacharacters are wrapped so delayed expansion leaves them intact.
pub fn escape_windows(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    let arg = arg.replace('\0', "?");
    if !arg.chars().any(|c| {
        c.is_whitespace() || matches!(c, '/' | '(' | ')' | '%' | '!' | '^' | '"' | '<' | '>' | '&' | '|')
    }) {
        return arg;
    }
    // Double the trailing backslash run so it does not escape the
    // closing quote we are about to add.
    let trailing = arg.chars().rev().take_while(|&c| c == '\\').count();
    let mut body = arg.clone();
    body.push_str(&"\\".repeat(trailing));

    let mut out = String::with_capacity(body.len() + 2);
    out.push('"');
    for ch in body.chars() {
        match ch {
            '"' => out.push_str("\"\""),
            '^' => out.push_str("\"^\""),
            '%' => out.push_str("\"%\""),
            '!' => out.push_str("\"!\""),
            '\n' => out.push_str("!LF!"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Join a pre-tokenized argument vector into the Windows command line.
pub fn join_argv_windows(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| escape_windows(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace `"${:NAME}"` placeholders with escaped values.
///
/// Values are looked up in `values`; a missing or removed name fails
/// with [`Error::InvalidArgument`]. `escape` is the platform escaping
/// function.
pub fn replace_placeholders(
    command: &str,
    values: &HashMap<String, String>,
    escape: fn(&str) -> String,
) -> Result<String> {
    const OPEN: &str = "\"${:";
    let mut out = String::with_capacity(command.len());
    let mut rest = command;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find("}\"") else {
            return Err(Error::invalid(format!(
                "unterminated placeholder in command: {command}"
            )));
        };
        let name = &after[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::invalid(format!(
                "invalid placeholder name \"{name}\" in command: {command}"
            )));
        }
        let Some(value) = values.get(name) else {
            return Err(Error::invalid(format!(
                "command contains placeholder \"{name}\" but no value was provided for it"
            )));
        };
        out.push_str(&escape(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn posix_escaping_wraps_and_doubles_quotes() {
        assert_eq!(escape_posix("plain"), "'plain'");
        assert_eq!(escape_posix(""), "''");
        assert_eq!(escape_posix("a'b"), "'a'\\''b'");
        assert_eq!(escape_posix("$HOME"), "'$HOME'");
    }

    #[test]
    fn argv_join_prefixes_exec() {
        let argv = vec!["echo".to_string(), "a b".to_string()];
        assert_eq!(join_argv_posix(&argv), "exec 'echo' 'a b'");
    }

    #[test]
    fn windows_escaping_handles_meta_and_trailing_backslashes() {
        assert_eq!(escape_windows("plain"), "plain");
        assert_eq!(escape_windows(""), "\"\"");
        assert_eq!(escape_windows("a b"), "\"a b\"");
        assert_eq!(escape_windows("100%"), "\"100\"%\"\"");
        assert_eq!(escape_windows("tail\\"), "\"tail\\\\\"");
        assert_eq!(escape_windows("nul\0byte"), "nul?byte");
    }

    #[test]
    fn placeholders_are_substituted_with_escaping() {
        let mut values = HashMap::new();
        values.insert("NAME".to_string(), "wor'ld".to_string());
        let out = replace_placeholders("echo \"${:NAME}\"", &values, escape_posix).unwrap();
        assert_eq!(out, "echo 'wor'\\''ld'");
    }

    #[test]
    fn missing_placeholder_value_is_invalid_argument() {
        let err = replace_placeholders("echo \"${:MISSING}\"", &HashMap::new(), escape_posix)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn malformed_placeholder_is_rejected() {
        let err =
            replace_placeholders("echo \"${:NO END", &HashMap::new(), escape_posix).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
