//! Strongly-typed event identifiers.
//!
//! An event is identified as `app::event_name`. The `app` half doubles as the
//! name of the fanout exchange (and durable queue) the event travels through.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::NameError;

/// Separator between the app and the event name in a qualified identifier.
pub const SEPARATOR: &str = "::";

/// Namespace identifier; also the exchange and queue name of the app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct App(String);

/// Event name, unique within its app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName(String);

macro_rules! impl_name_newtype {
    ($t:ty, $what:literal) => {
        impl $t {
            /// Validate and wrap an identifier.
            ///
            /// Surrounding whitespace is trimmed; empty values and values containing
            /// the `::` separator are rejected.
            pub fn new(value: impl AsRef<str>) -> Result<Self, NameError> {
                let value = value.as_ref().trim();
                if value.is_empty() {
                    return Err(NameError::Empty($what));
                }
                if value.contains(SEPARATOR) {
                    return Err(NameError::ContainsSeparator {
                        what: $what,
                        value: value.to_string(),
                    });
                }
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl core::borrow::Borrow<str> for $t {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_name_newtype!(App, "app");
impl_name_newtype!(EventName, "event name");

/// Fully qualified event identifier (`app::event_name`).
///
/// Always exactly two non-empty tokens; the first is the exchange the event is
/// published to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QualifiedEvent {
    app: App,
    name: EventName,
}

impl QualifiedEvent {
    pub fn new(app: App, name: EventName) -> Self {
        Self { app, name }
    }

    /// Parse `app::event_name`.
    pub fn parse(value: &str) -> Result<Self, NameError> {
        let (app, name) = value
            .split_once(SEPARATOR)
            .ok_or_else(|| NameError::Malformed(value.to_string()))?;
        let app = App::new(app).map_err(|_| NameError::Malformed(value.to_string()))?;
        let name = EventName::new(name).map_err(|_| NameError::Malformed(value.to_string()))?;
        Ok(Self { app, name })
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn event_name(&self) -> &EventName {
        &self.name
    }
}

impl core::fmt::Display for QualifiedEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}{}", self.app, SEPARATOR, self.name)
    }
}

impl FromStr for QualifiedEvent {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QualifiedEvent {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QualifiedEvent> for String {
    fn from(value: QualifiedEvent) -> Self {
        value.to_string()
    }
}

/// A registered event.
///
/// Events are created during boot by the registry and are immutable after
/// registration. Holding an `Event` is the proof that the identifier was
/// registered; envelopes can only be built from one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    qualified: QualifiedEvent,
}

impl Event {
    /// Create an event. Only the registry should call this.
    pub fn new(app: App, name: EventName) -> Self {
        Self {
            qualified: QualifiedEvent::new(app, name),
        }
    }

    pub fn app(&self) -> &App {
        self.qualified.app()
    }

    pub fn event_name(&self) -> &EventName {
        self.qualified.event_name()
    }

    pub fn qualified(&self) -> &QualifiedEvent {
        &self.qualified
    }

    /// Fully qualified name, e.g. `policy::PolicyPublished`.
    pub fn name(&self) -> String {
        self.qualified.to_string()
    }
}

impl core::fmt::Display for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.qualified, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_validated() {
        assert_eq!(App::new("  policy ").unwrap().as_str(), "policy");
        assert_eq!(App::new(""), Err(NameError::Empty("app")));
        assert_eq!(EventName::new("   "), Err(NameError::Empty("event name")));
        assert!(matches!(
            EventName::new("a::b"),
            Err(NameError::ContainsSeparator { .. })
        ));
    }

    #[test]
    fn qualified_event_parses_exactly_two_tokens() {
        let q = QualifiedEvent::parse("policy::PolicyPublished").unwrap();
        assert_eq!(q.app().as_str(), "policy");
        assert_eq!(q.event_name().as_str(), "PolicyPublished");
        assert_eq!(q.to_string(), "policy::PolicyPublished");

        assert!(QualifiedEvent::parse("PolicyPublished").is_err());
        assert!(QualifiedEvent::parse("::PolicyPublished").is_err());
        assert!(QualifiedEvent::parse("policy::").is_err());
        assert!(QualifiedEvent::parse("a::b::c").is_err());
    }

    #[test]
    fn event_name_is_fully_qualified() {
        let event = Event::new(App::new("policy").unwrap(), EventName::new("PolicyPublished").unwrap());
        assert_eq!(event.name(), "policy::PolicyPublished");
        assert_eq!(event.app().as_str(), "policy");
    }

    #[test]
    fn qualified_event_serializes_as_string() {
        let q = QualifiedEvent::parse("vendor::VendorCreated").unwrap();
        let json = serde_json::to_string(&q).unwrap();
        assert_eq!(json, "\"vendor::VendorCreated\"");
        let back: QualifiedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
        assert!(serde_json::from_str::<QualifiedEvent>("\"nope\"").is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn display_then_parse_is_identity(app in "[a-z_]{1,12}", name in "[A-Za-z]{1,24}") {
                let q = QualifiedEvent::new(App::new(&app).unwrap(), EventName::new(&name).unwrap());
                let parsed = QualifiedEvent::parse(&q.to_string()).unwrap();
                prop_assert_eq!(parsed.app().as_str(), app.as_str());
                prop_assert_eq!(parsed.event_name().as_str(), name.as_str());
            }

            #[test]
            fn strings_without_separator_never_parse(s in "[^:]{0,32}") {
                prop_assert!(QualifiedEvent::parse(&s).is_err());
            }
        }
    }
}
