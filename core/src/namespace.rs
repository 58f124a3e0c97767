//! Bidirectional mapping between `(server, tool)` pairs and a flat, unique
//! wire name.
//!
//! Parsing is greedy longest-prefix: when one server name is itself a
//! prefix of another (`"test"` vs. `"test_server"`), the longer candidate
//! wins so `test_server__do_thing` resolves to `(test_server, do_thing)`
//! rather than `(test, server__do_thing)`.

pub const DEFAULT_SEPARATOR: &str = "__";

/// `server<sep>tool`. Tool names may be empty.
pub fn namespace(server: &str, tool: &str, sep: &str) -> String {
    format!("{server}{sep}{tool}")
}

/// Greedy longest-prefix parse of a wire name against the set of known
/// server names. Returns `None` if no known server's `<name><sep>` prefixes
/// `wire_name`.
pub fn parse<'a>(
    wire_name: &str,
    known_servers: impl IntoIterator<Item = &'a str>,
    sep: &str,
) -> Option<(String, String)> {
    let mut servers: Vec<&str> = known_servers.into_iter().collect();
    servers.sort_by_key(|s| std::cmp::Reverse(s.len()));

    for server in servers {
        let prefix = format!("{server}{sep}");
        if let Some(tool) = wire_name.strip_prefix(&prefix) {
            return Some((server.to_string(), tool.to_string()));
        }
    }
    None
}

/// Removes the `server<sep>` prefix if present; returns the input unchanged
/// otherwise.
pub fn strip<'a>(wire_name: &'a str, server: &str, sep: &str) -> &'a str {
    let prefix = format!("{server}{sep}");
    wire_name.strip_prefix(prefix.as_str()).unwrap_or(wire_name)
}
