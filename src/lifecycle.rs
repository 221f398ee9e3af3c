//! App lifecycle states and screen-change tracking.

use crate::event::{Event, Properties, SCREEN_EVENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

/// Host application state, as reported by the embedding app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl AppState {
    /// Leaving the foreground: queued events should go out now.
    pub fn should_flush(self) -> bool {
        matches!(self, AppState::Inactive | AppState::Background)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppState::Active => write!(f, "active"),
            AppState::Inactive => write!(f, "inactive"),
            AppState::Background => write!(f, "background"),
        }
    }
}

impl std::str::FromStr for AppState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AppState::Active),
            "inactive" => Ok(AppState::Inactive),
            "background" => Ok(AppState::Background),
            _ => anyhow::bail!(
                "Invalid app state '{}'. Valid values: active, inactive, background",
                s
            ),
        }
    }
}

/// Remembers the active screen and produces a `_screen` event on change.
#[derive(Debug, Default)]
pub struct ScreenTracker {
    current: Mutex<Option<String>>,
}

impl ScreenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record `screen` as active. Returns the event to track, or `None` when
    /// the screen did not change.
    pub fn navigate(&self, screen: &str) -> Option<Event> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() == Some(screen) {
            return None;
        }
        let previous = current.replace(screen.to_string());

        let mut properties = Properties::new();
        properties.insert("screen".into(), Value::from(screen));
        properties.insert(
            "previous_screen".into(),
            previous.map(Value::from).unwrap_or(Value::Null),
        );
        Some(Event::new(SCREEN_EVENT, properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_navigation_has_no_previous_screen() {
        let tracker = ScreenTracker::new();
        let event = tracker.navigate("home").unwrap();
        assert_eq!(event.name, "_screen");
        assert_eq!(event.properties["screen"], "home");
        assert!(event.properties["previous_screen"].is_null());
    }

    #[test]
    fn test_same_screen_is_a_no_op() {
        let tracker = ScreenTracker::new();
        assert!(tracker.navigate("home").is_some());
        assert!(tracker.navigate("home").is_none());

        let event = tracker.navigate("wallet").unwrap();
        assert_eq!(event.properties["previous_screen"], "home");
        assert_eq!(tracker.current().as_deref(), Some("wallet"));
    }

    #[test]
    fn test_should_flush_only_when_leaving_foreground() {
        assert!(!AppState::Active.should_flush());
        assert!(AppState::Inactive.should_flush());
        assert!(AppState::Background.should_flush());
    }

    #[test]
    fn test_app_state_from_str() {
        assert_eq!("Background".parse::<AppState>().unwrap(), AppState::Background);
        assert_eq!(AppState::Inactive.to_string(), "inactive");
        assert!("sleeping".parse::<AppState>().is_err());
    }
}
