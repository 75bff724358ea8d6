//! Capability declarations: the fixed list of events an action type may emit
//! or listen for.

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::ids::ActionType;

/// Maximum edit distance at which an undeclared event gets a "did you mean"
/// suggestion.
pub const SUGGESTION_DISTANCE: usize = 3;

/// Immutable, ordered, non-empty list of event names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    events: Vec<String>,
}

impl CapabilityDeclaration {
    /// Build a declaration. Duplicates collapse onto their first occurrence.
    pub fn new<I, S>(events: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events: IndexSet<String> = events.into_iter().map(Into::into).collect();
        if events.is_empty() {
            return Err(HarnessError::EmptyDeclaration);
        }
        Ok(Self {
            events: events.into_iter().collect(),
        })
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn allows(&self, event: &str) -> bool {
        self.events.iter().any(|declared| declared == event)
    }

    /// Closest declared name within [`SUGGESTION_DISTANCE`] edits. Ties go to
    /// the earliest declared name.
    pub fn suggest(&self, event: &str) -> Option<&str> {
        let mut best: Option<(usize, &str)> = None;
        for declared in &self.events {
            let distance = edit_distance(event, declared);
            if distance > SUGGESTION_DISTANCE {
                continue;
            }
            if best.is_none_or(|(current, _)| distance < current) {
                best = Some((distance, declared));
            }
        }
        best.map(|(_, name)| name)
    }

    fn hint(&self, event: &str) -> String {
        match self.suggest(event) {
            Some(name) => format!("Did you mean: '{name}'?"),
            None => format!("Allowed: {}", self.events.join(", ")),
        }
    }
}

/// Which side of the bus an event check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventVerb {
    Emit,
    Listen,
}

impl fmt::Display for EventVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emit => write!(f, "emit"),
            Self::Listen => write!(f, "listen for"),
        }
    }
}

/// Validate `event` against an optional declaration. An absent declaration
/// permits nothing.
pub fn check_event(
    declaration: Option<&CapabilityDeclaration>,
    action: &ActionType,
    event: &str,
    verb: EventVerb,
) -> HarnessResult<()> {
    let hint = match declaration {
        Some(declaration) if declaration.allows(event) => return Ok(()),
        Some(declaration) => declaration.hint(event),
        None => format!("{action} declares no events"),
    };
    Err(HarnessError::EventNotDeclared {
        action: action.clone(),
        event: event.to_owned(),
        verb,
        hint,
    })
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != *cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration() -> CapabilityDeclaration {
        CapabilityDeclaration::new(["test.event.a", "test.event.b"]).unwrap()
    }

    #[test]
    fn empty_declaration_is_rejected() {
        let err = CapabilityDeclaration::new(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, HarnessError::EmptyDeclaration));
        assert_eq!(err.to_string(), "Events array cannot be empty");
    }

    #[test]
    fn duplicates_keep_first_position() {
        let declaration = CapabilityDeclaration::new(["b", "a", "b"]).unwrap();
        assert_eq!(declaration.events(), ["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn declared_events_pass() {
        let ty = ActionType::new("ClosureAction");
        assert!(check_event(Some(&declaration()), &ty, "test.event.a", EventVerb::Emit).is_ok());
        assert!(
            check_event(Some(&declaration()), &ty, "test.event.b", EventVerb::Listen).is_ok()
        );
    }

    #[test]
    fn near_miss_suggests_closest_name() {
        let ty = ActionType::new("ClosureAction");
        let err = check_event(Some(&declaration()), &ty, "test.event.c", EventVerb::Emit)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot emit event 'test.event.c'. Did you mean: 'test.event.a'?"
        );
    }

    #[test]
    fn distant_name_lists_all_declared_events() {
        let ty = ActionType::new("ClosureAction");
        let err = check_event(Some(&declaration()), &ty, "invalid-event", EventVerb::Listen)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot listen for event 'invalid-event'. Allowed: test.event.a, test.event.b"
        );
    }

    #[test]
    fn missing_declaration_permits_nothing() {
        let ty = ActionType::new("Plain");
        let err = check_event(None, &ty, "anything", EventVerb::Emit).unwrap_err();
        assert!(err.to_string().contains("'anything'"));
        assert!(err.to_string().contains("Plain declares no events"));
    }

    #[test]
    fn suggestion_threshold_is_inclusive() {
        let declaration = CapabilityDeclaration::new(["a", "b"]).unwrap();
        assert_eq!(declaration.suggest("c"), Some("a"));
        assert_eq!(declaration.suggest("abcd"), Some("a"));
        assert_eq!(declaration.suggest("abcde"), None);
    }

    #[test]
    fn edit_distance_counts_insertions_deletions_and_substitutions() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("flaw", "lawn"), 2);
    }
}
