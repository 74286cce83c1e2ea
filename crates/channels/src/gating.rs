/// Rule-scoped @-mention gate.
///
/// Passes when the rule does not require mentions, when it lists no usable
/// names, or when `content` contains `@<name>` for one of the trimmed names.
/// Matching is exact, so `@bot` does not satisfy a rule naming `Bot`.
pub fn at_mention_gate(content: &str, only_at_messages: bool, at_names: &[String]) -> bool {
    if !only_at_messages {
        return true;
    }
    let mut names = at_names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .peekable();
    if names.peek().is_none() {
        return true;
    }
    names.any(|name| content.contains(&format!("@{name}")))
}

/// Split a stored comma list of names (`"bot, admin"`) into trimmed entries.
pub fn parse_at_names(stored: &str) -> Vec<String> {
    stored
        .split([',', '，'])
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect()
}
