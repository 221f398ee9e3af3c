//! Event types and send-time enrichment.

use crate::identity::IdentityResolver;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};

/// Event properties: string keys to arbitrary JSON values.
pub type Properties = Map<String, Value>;

/// Synthetic event emitted when the active screen changes.
pub const SCREEN_EVENT: &str = "_screen";
/// Synthetic event emitted the first time a subject is bucketed into an experiment.
pub const EXPOSURE_EVENT: &str = "_experiment_exposure";

/// An event as tracked by the caller, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub properties: Properties,
}

impl Event {
    pub fn new(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }
}

/// Fixed contextual properties attached to every outgoing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceContext {
    /// `std::env::consts::OS`
    pub platform: String,
    /// `std::env::consts::ARCH`
    pub os_arch: String,
    pub app_name: String,
    pub app_version: String,
}

impl DeviceContext {
    /// Context for the current host and the given app.
    pub fn detect(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    fn write_into(&self, props: &mut Properties) {
        props.insert("platform".into(), Value::from(self.platform.as_str()));
        props.insert("os_arch".into(), Value::from(self.os_arch.as_str()));
        props.insert("app_name".into(), Value::from(self.app_name.as_str()));
        props.insert("app_version".into(), Value::from(self.app_version.as_str()));
        props.insert("library".into(), Value::from(env!("CARGO_PKG_NAME")));
        props.insert("library_version".into(), Value::from(env!("CARGO_PKG_VERSION")));
    }
}

/// The enriched event that goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEvent {
    pub event: String,
    /// Context, identity, user and call properties merged
    pub properties: Properties,
    /// Authenticated user id, else the anonymous id
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Builds `OutgoingEvent`s from queued events at send time.
///
/// Merge order, later wins: device context, `anonymous_id`, user properties,
/// per-call properties. `sent_at` is always set last.
pub struct Enricher {
    context: DeviceContext,
    identity: Arc<IdentityResolver>,
    user_properties: RwLock<Properties>,
}

impl Enricher {
    pub fn new(context: DeviceContext, identity: Arc<IdentityResolver>) -> Self {
        Self {
            context,
            identity,
            user_properties: RwLock::new(Properties::new()),
        }
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Merge into the global user properties.
    pub fn set_user_properties(&self, props: Properties) {
        let mut current = self
            .user_properties
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        current.extend(props);
    }

    pub fn clear_user_properties(&self) {
        self.user_properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn user_properties(&self) -> Properties {
        self.user_properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn enrich(&self, event: Event) -> OutgoingEvent {
        let mut properties = Properties::new();
        self.context.write_into(&mut properties);
        properties.insert(
            "anonymous_id".into(),
            Value::from(self.identity.anonymous_id()),
        );
        properties.extend(self.user_properties());
        properties.extend(event.properties);
        properties.insert(
            "sent_at".into(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        OutgoingEvent {
            event: event.name,
            properties,
            user_id: self.identity.subject_id(),
        }
    }
}

/// Build `Properties` from `key => value` pairs.
///
/// ```
/// let props = beacon::props! { "plan" => "pro", "seats" => 3 };
/// assert_eq!(props["seats"], 3);
/// ```
#[macro_export]
macro_rules! props {
    () => {
        $crate::event::Properties::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::event::Properties::new();
        $(map.insert(($key).to_string(), $crate::__private::json!($value));)+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryStore;
    use serde_json::json;

    fn enricher() -> Enricher {
        let identity = Arc::new(IdentityResolver::new(Arc::new(MemoryStore::new())));
        Enricher::new(DeviceContext::detect("superapp", "2.1.0"), identity)
    }

    #[test]
    fn test_enrich_adds_context_and_identity() {
        let enricher = enricher();
        let out = enricher.enrich(Event::new("signup", crate::props! { "plan" => "pro" }));

        assert_eq!(out.event, "signup");
        assert_eq!(out.properties["plan"], "pro");
        assert_eq!(out.properties["app_name"], "superapp");
        assert_eq!(out.properties["app_version"], "2.1.0");
        assert_eq!(out.properties["platform"], std::env::consts::OS);
        assert_eq!(out.properties["library"], "beacon");
        let anon = enricher.identity().anonymous_id();
        assert_eq!(out.properties["anonymous_id"], json!(anon));
        assert_eq!(out.user_id, anon);
        assert!(out.properties["sent_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_call_properties_override_user_properties() {
        let enricher = enricher();
        enricher.set_user_properties(crate::props! { "plan" => "free", "locale" => "en" });

        let out = enricher.enrich(Event::new("upgrade", crate::props! { "plan" => "pro" }));
        assert_eq!(out.properties["plan"], "pro");
        assert_eq!(out.properties["locale"], "en");
    }

    #[test]
    fn test_user_properties_merge_and_clear() {
        let enricher = enricher();
        enricher.set_user_properties(crate::props! { "a" => 1 });
        enricher.set_user_properties(crate::props! { "b" => 2 });
        assert_eq!(enricher.user_properties().len(), 2);

        enricher.clear_user_properties();
        let out = enricher.enrich(Event::new("x", Properties::new()));
        assert!(out.properties.get("a").is_none());
    }

    #[test]
    fn test_authenticated_user_becomes_user_id() {
        let enricher = enricher();
        enricher.identity().identify("user-42");
        let out = enricher.enrich(Event::new("login", Properties::new()));
        assert_eq!(out.user_id, "user-42");
        assert_ne!(out.properties["anonymous_id"], json!("user-42"));
    }

    #[test]
    fn test_outgoing_event_serializes_user_id_in_camel_case() {
        let out = OutgoingEvent {
            event: "e".into(),
            properties: Properties::new(),
            user_id: "u".into(),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains(r#""userId":"u""#));
    }

    #[test]
    fn test_props_macro() {
        let empty = crate::props! {};
        assert!(empty.is_empty());
        let props = crate::props! { "n" => 1, "flag" => true, "s" => "x" };
        assert_eq!(props["n"], 1);
        assert_eq!(props["flag"], true);
        assert_eq!(props["s"], "x");
    }
}
