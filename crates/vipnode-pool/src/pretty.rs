//! Log formatting helpers.

const ABBREV_LEN: usize = 8;

/// Shorten a node ID for log lines: the first 8 characters and an ellipsis.
pub fn abbrev(id: &str) -> String {
    match id.char_indices().nth(ABBREV_LEN) {
        Some((end, _)) => format!("{}…", &id[..end]),
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abbrev() {
        assert_eq!(abbrev("0123456789abcdef"), "01234567…");
        assert_eq!(abbrev("01234567"), "01234567");
        assert_eq!(abbrev("short"), "short");
    }
}
