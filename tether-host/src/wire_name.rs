//! Wire tool names.
//!
//! A tool crosses the provider boundary as `server_tool`, where both
//! parts have `.`, space, and `-` replaced by `_`. Encoding is a pure
//! function; decoding matches the longest known server prefix, so two
//! servers can expose the same native tool name without colliding.

use tether_types::HostError;

/// Normalize one name component for the wire.
#[must_use]
pub fn normalize(part: &str) -> String {
    part.replace(['.', ' ', '-'], "_")
}

/// Derive the wire name for `tool` on `server`.
#[must_use]
pub fn encode(server: &str, tool: &str) -> String {
    format!("{}_{}", normalize(server), normalize(tool))
}

/// Resolve a wire name back to `(server, normalized_tool)`.
///
/// The match is the *longest* normalized server name that is a prefix of
/// `wire` followed by `_`. Returns `None` when no configured server
/// matches.
#[must_use]
pub fn decode<'a, I>(wire: &str, servers: I) -> Option<(&'a str, &str)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, usize)> = None;
    for server in servers {
        let prefix = normalize(server);
        if wire.len() > prefix.len() + 1
            && wire.starts_with(&prefix)
            && wire.as_bytes()[prefix.len()] == b'_'
            && best.is_none_or(|(_, len)| prefix.len() > len)
        {
            best = Some((server, prefix.len()));
        }
    }
    best.map(|(server, len)| (server, &wire[len + 1..]))
}

/// Check that every `(server, tool)` pair in the configured set maps to
/// a distinct wire name. Fails closed on the first collision.
///
/// # Errors
///
/// [`HostError::WireCollision`] naming both servers involved.
pub fn verify_unambiguous<'a, I>(pairs: I) -> Result<(), HostError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut seen: std::collections::HashMap<String, &str> = std::collections::HashMap::new();
    for (server, tool) in pairs {
        let wire = encode(server, tool);
        if let Some(first) = seen.insert(wire.clone(), server)
            && first != server
        {
            return Err(HostError::WireCollision {
                wire,
                first: first.to_string(),
                second: server.to_string(),
            });
        }
    }
    Ok(())
}
