//! Capture resolution: operator token -> target sessions.
//!
//! Grammar (case-insensitive, whitespace ignored):
//!
//! ```text
//! capture := item ("," item)*
//! item    := "all" | "*" | id | id "-" id
//! ```
//!
//! `all` and ranges expand to connected sessions only. A bare id names that
//! session even when it is disconnected, so the operator gets a
//! `NotConnected` for it instead of a silent skip. Results keep first
//! appearance order with duplicates removed. A token that parses to nothing
//! or matches nothing is `NoMatch`.

use std::{collections::HashSet, sync::Arc};

use tether_core::{CommandError, SessionId};

use crate::{Registry, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    All,
    Id(SessionId),
    Range(SessionId, SessionId),
}

fn parse(token: &str) -> Option<Vec<Item>> {
    let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    compact
        .split(',')
        .map(|item| {
            if item.eq_ignore_ascii_case("all") || item == "*" {
                return Some(Item::All);
            }
            if let Some((start, end)) = item.split_once('-') {
                let (start, end) = (start.parse().ok()?, end.parse().ok()?);
                return (start <= end).then_some(Item::Range(start, end));
            }
            item.parse().ok().map(Item::Id)
        })
        .collect()
}

/// Resolve `token` against a snapshot of `registry`.
///
/// # Errors
/// Returns `NoMatch` if the token does not parse or selects no session.
pub fn resolve(registry: &Registry, token: &str) -> Result<Vec<Arc<Session>>, CommandError> {
    let no_match = || CommandError::NoMatch(token.trim().to_string());
    let items = parse(token).ok_or_else(no_match)?;
    let snapshot = registry.list();

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for item in items {
        for (session, connected) in &snapshot {
            let id = session.id();
            let selected = match item {
                Item::All => *connected,
                Item::Range(start, end) => *connected && (start..=end).contains(&id),
                Item::Id(wanted) => id == wanted,
            };
            if selected && seen.insert(id) {
                targets.push(Arc::clone(session));
            }
        }
    }

    if targets.is_empty() {
        Err(no_match())
    } else {
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(connected: &[bool]) -> Registry {
        let registry = Registry::new();
        for &up in connected {
            let id = registry.allocate_id();
            registry
                .register(Arc::new(Session::new(id, None, tokio::io::sink())))
                .unwrap();
            if !up {
                registry.mark_disconnected(id);
            }
        }
        registry
    }

    fn ids(result: Result<Vec<Arc<Session>>, CommandError>) -> Vec<SessionId> {
        result.unwrap().iter().map(|s| s.id()).collect()
    }

    #[test]
    fn all_excludes_disconnected() {
        let registry = registry_with(&[true, false]);
        assert_eq!(ids(resolve(&registry, "all")), vec![1]);
        assert_eq!(ids(resolve(&registry, " * ")), vec![1]);
        assert_eq!(ids(resolve(&registry, "ALL")), vec![1]);
    }

    #[test]
    fn unknown_tokens_never_succeed_empty() {
        let registry = registry_with(&[true]);
        for token in ["unknown-token", "", "7", "1,,2", "3-1", "x-2", "-"] {
            assert!(
                matches!(resolve(&registry, token), Err(CommandError::NoMatch(_))),
                "token {token:?} should not match"
            );
        }
        assert!(matches!(
            resolve(&Registry::new(), "all"),
            Err(CommandError::NoMatch(_))
        ));
    }

    #[test]
    fn explicit_id_keeps_disconnected_session() {
        let registry = registry_with(&[true, false]);
        let targets = resolve(&registry, "2").unwrap();
        assert_eq!(targets.len(), 1);
        assert!(!targets[0].is_connected());
    }

    #[test]
    fn lists_and_ranges_dedupe_in_order() {
        let registry = registry_with(&[true, true, false, true, true]);
        assert_eq!(ids(resolve(&registry, "4, 2-5")), vec![4, 2, 5]);
        assert_eq!(ids(resolve(&registry, "3,1-2,all")), vec![3, 1, 2, 4, 5]);
        assert_eq!(ids(resolve(&registry, "2-2")), vec![2]);
    }
}
