//! Query mapper interface (spec.md §4.4).
//!
//! A mapper classifies a client query as `ANY` (route to one arbitrary
//! backend) or `ALL` (fan out to every backend), optionally rewriting the
//! query for routing purposes. The legacy `lt_dlopen`-based dynamic
//! loader is out of scope (spec.md §1); the trait object below is the
//! only extension point. Absence of a mapper is equivalent to `ANY` for
//! every query — that default lives in the dispatcher, not here.

/// The routing decision for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapDecision {
    /// Route to a single, uniformly-random backend.
    Any { rewritten: Option<Vec<u8>> },
    /// Fan out to every backend.
    All { rewritten: Option<Vec<u8>> },
}

impl MapDecision {
    pub fn rewritten(&self) -> Option<&[u8]> {
        match self {
            MapDecision::Any { rewritten } | MapDecision::All { rewritten } => {
                rewritten.as_deref()
            }
        }
    }
}

/// A pluggable query router.
pub trait QueryMapper: Send + Sync {
    fn map(&self, query: &[u8]) -> MapDecision;
}

const ANY_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "EXPLAIN"];

/// The reference mapper: reads route to any one backend, everything else
/// fans out to all of them.
#[derive(Debug, Default)]
pub struct ReadOneWriteAll;

impl QueryMapper for ReadOneWriteAll {
    fn map(&self, query: &[u8]) -> MapDecision {
        let leading = leading_keyword(query);
        let is_read = ANY_KEYWORDS
            .iter()
            .any(|kw| leading.eq_ignore_ascii_case(kw.as_bytes()));

        if is_read {
            MapDecision::Any { rewritten: None }
        } else {
            MapDecision::All { rewritten: None }
        }
    }
}

fn leading_keyword(query: &[u8]) -> &[u8] {
    let trimmed = {
        let start = query
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(query.len());
        &query[start..]
    };
    let end = trimmed
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_and_friends_route_to_any() {
        let mapper = ReadOneWriteAll;
        for q in [
            "select 1",
            "  SELECT * FROM t",
            "SHOW TABLES",
            "Describe t",
            "explain select 1",
        ] {
            assert_eq!(
                mapper.map(q.as_bytes()),
                MapDecision::Any { rewritten: None },
                "query {q:?} should route ANY"
            );
        }
    }

    #[test]
    fn writes_route_to_all() {
        let mapper = ReadOneWriteAll;
        for q in ["INSERT INTO t VALUES(1)", "update t set a=1", "DELETE FROM t"] {
            assert_eq!(
                mapper.map(q.as_bytes()),
                MapDecision::All { rewritten: None },
                "query {q:?} should route ALL"
            );
        }
    }

    #[test]
    fn empty_query_routes_all() {
        let mapper = ReadOneWriteAll;
        assert_eq!(mapper.map(b""), MapDecision::All { rewritten: None });
    }

    #[test]
    fn leading_keyword_ignores_surrounding_whitespace() {
        assert_eq!(leading_keyword(b"   SELECT 1"), b"SELECT");
        assert_eq!(leading_keyword(b"SELECT"), b"SELECT");
        assert_eq!(leading_keyword(b"   "), b"");
    }
}
