//! The small XPath subset the simulated backend understands
//!
//! Accepted forms: absent, empty, `*`, and `*[System[...]]` where the inner
//! condition is one or more `EventID=N` / `Level=N` terms joined by `or`,
//! optionally parenthesised.

use super::event::MockRecord;
use crate::error::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    EventId(u16),
    Level(u8),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct QueryFilter {
    terms: Option<Vec<Term>>,
}

impl QueryFilter {
    pub fn parse(query: Option<&str>) -> Result<Self, Status> {
        let query = query.map(str::trim).unwrap_or("");
        if query.is_empty() || query == "*" {
            return Ok(Self::default());
        }
        let inner = query
            .strip_prefix("*[System[")
            .and_then(|q| q.strip_suffix("]]"))
            .ok_or(Status::EVT_INVALID_QUERY)?;
        let terms = split_or(strip_parens(inner))
            .into_iter()
            .map(parse_term)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { terms: Some(terms) })
    }

    pub fn matches(&self, record: &MockRecord) -> bool {
        match &self.terms {
            None => true,
            Some(terms) => terms.iter().any(|term| match term {
                Term::EventId(id) => record.event.event_id == *id,
                Term::Level(level) => record.event.level == *level,
            }),
        }
    }
}

fn strip_parens(mut text: &str) -> &str {
    loop {
        text = text.trim();
        match text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
            Some(inner) if !inner.contains(['(', ')']) || balanced(inner) => text = inner,
            _ => return text,
        }
    }
}

fn balanced(text: &str) -> bool {
    let mut depth = 0i32;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn split_or(text: &str) -> Vec<&str> {
    text.split(" or ").map(strip_parens).collect()
}

fn parse_term(term: &str) -> Result<Term, Status> {
    let (name, value) = term.split_once('=').ok_or(Status::EVT_INVALID_QUERY)?;
    let value = value.trim();
    match name.trim() {
        "EventID" => value
            .parse()
            .map(Term::EventId)
            .map_err(|_| Status::EVT_INVALID_QUERY),
        "Level" => value
            .parse()
            .map(Term::Level)
            .map_err(|_| Status::EVT_INVALID_QUERY),
        _ => Err(Status::EVT_INVALID_QUERY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::event::MockEvent;
    use crate::time::FileTime;

    fn record(event_id: u16, level: u8) -> MockRecord {
        MockRecord {
            channel: "Application".into(),
            record_id: 1,
            time_created: FileTime(0),
            event: MockEvent::new("P", event_id).with_level(level),
        }
    }

    #[test]
    fn test_match_all_forms() {
        for q in [None, Some(""), Some("*"), Some("  * ")] {
            let filter = QueryFilter::parse(q).unwrap();
            assert!(filter.matches(&record(1, 4)));
        }
    }

    #[test]
    fn test_event_id_and_level_terms() {
        let filter = QueryFilter::parse(Some("*[System[(EventID=7036 or Level=2)]]")).unwrap();
        assert!(filter.matches(&record(7036, 4)));
        assert!(filter.matches(&record(1, 2)));
        assert!(!filter.matches(&record(1, 4)));

        let single = QueryFilter::parse(Some("*[System[EventID=4624]]")).unwrap();
        assert!(single.matches(&record(4624, 0)));
        assert!(!single.matches(&record(4625, 0)));
    }

    #[test]
    fn test_malformed_queries() {
        for q in ["Event", "*[System[Bogus=1]]", "*[System[EventID=abc]]", "*[System[EventID=1]"] {
            assert_eq!(QueryFilter::parse(Some(q)), Err(Status::EVT_INVALID_QUERY), "{}", q);
        }
    }
}
