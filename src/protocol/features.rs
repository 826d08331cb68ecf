//! Role feature advertisement.
//!
//! Features are static metadata sent in HELLO under `roles`; the client
//! does not change behavior based on them.

use serde_json::Value;

use super::Dict;

/// Client roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends PUBLISH
    Publisher,
    /// Receives EVENT
    Subscriber,
    /// Sends CALL
    Caller,
    /// Receives INVOCATION
    Callee,
}

impl Role {
    /// All client roles, in dispatch order.
    pub const ALL: [Role; 4] = [Role::Publisher, Role::Subscriber, Role::Caller, Role::Callee];

    /// Role name used as the HELLO `roles` key.
    pub fn name(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }

    /// Advertised feature flags.
    pub fn features(self) -> &'static [&'static str] {
        match self {
            Role::Publisher => &[
                "subscriber_blackwhite_listing",
                "publisher_exclusion",
                "publisher_identification",
                "sharded_subscription",
            ],
            Role::Subscriber => &[
                "publisher_identification",
                "publication_trustlevels",
                "pattern_based_subscription",
                "sharded_subscription",
                "event_history",
            ],
            Role::Caller => &[
                "progressive_call_results",
                "call_timeout",
                "call_canceling",
                "caller_identification",
                "sharded_registration",
            ],
            Role::Callee => &[
                "progressive_call_results",
                "call_timeout",
                "call_canceling",
                "caller_identification",
                "call_trustlevels",
                "pattern_based_registration",
                "sharded_registration",
                "shared_registration",
            ],
        }
    }

    /// `{ "features": { flag: true, ... } }` for this role.
    pub fn advertisement(self) -> Value {
        let features: Dict = self
            .features()
            .iter()
            .map(|f| ((*f).to_string(), Value::Bool(true)))
            .collect();
        let mut role = Dict::new();
        role.insert("features".into(), Value::Object(features));
        Value::Object(role)
    }

    /// HELLO `roles` dictionary covering every client role.
    pub fn hello_roles() -> Dict {
        Self::ALL
            .iter()
            .map(|role| (role.name().to_string(), role.advertisement()))
            .collect()
    }
}
