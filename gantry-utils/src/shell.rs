/// Quote `value` so a POSIX shell passes it through as a single word.
pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote `value` for a PowerShell single-quoted string.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_handles_empty_and_quotes() {
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("simple"), "'simple'");
        assert_eq!(sh_quote("we're"), "'we'\"'\"'re'");
    }

    #[test]
    fn ps_quote_doubles_single_quotes() {
        assert_eq!(ps_quote("C:\\Program Files"), "'C:\\Program Files'");
        assert_eq!(ps_quote("it's"), "'it''s'");
    }
}
