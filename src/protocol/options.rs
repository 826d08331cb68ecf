//! Typed request options and message details.
//!
//! Options are decided at the API boundary and lowered into the protocol
//! dictionaries here; details coming from the router are lifted into typed
//! structs with the remaining keys preserved in `extra`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Dict, Id, List, Uri};

/// Topic/procedure matching policy for subscribe and register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Exact URI match (no `match` option is sent)
    #[default]
    Exact,
    /// Prefix match
    Prefix,
    /// Wildcard match with empty URI components
    Wildcard,
}

impl MatchPolicy {
    /// Value of the `match` option, `None` for exact matching.
    pub fn as_option(self) -> Option<&'static str> {
        match self {
            MatchPolicy::Exact => None,
            MatchPolicy::Prefix => Some("prefix"),
            MatchPolicy::Wildcard => Some("wildcard"),
        }
    }
}

/// How the router should treat a cancelled call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelMode {
    /// Stop waiting for the result, leave the callee running
    Skip,
    /// Interrupt the callee and wait for its error
    #[default]
    Kill,
    /// Interrupt the callee without waiting
    #[serde(rename = "killnowait")]
    KillNoWait,
}

impl CancelMode {
    /// Wire value of the `mode` option.
    pub fn as_str(self) -> &'static str {
        match self {
            CancelMode::Skip => "skip",
            CancelMode::Kill => "kill",
            CancelMode::KillNoWait => "killnowait",
        }
    }
}

/// Invocation policy for shared registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokePolicy {
    /// Only one registration allowed
    Single,
    /// Rotate between callees
    RoundRobin,
    /// Pick a random callee
    Random,
    /// First registered callee
    First,
    /// Last registered callee
    Last,
}

impl InvokePolicy {
    fn as_str(self) -> &'static str {
        match self {
            InvokePolicy::Single => "single",
            InvokePolicy::RoundRobin => "roundrobin",
            InvokePolicy::Random => "random",
            InvokePolicy::First => "first",
            InvokePolicy::Last => "last",
        }
    }
}

/// Options for `publish`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Wait for PUBLISHED before resolving
    pub acknowledge: bool,
    /// Exclude this session from receivers (router default when `None`)
    pub exclude_me: Option<bool>,
    /// Session ids excluded from delivery
    pub exclude: Vec<Id>,
    /// Session ids eligible for delivery
    pub eligible: Vec<Id>,
    /// Disclose publisher identity
    pub disclose_me: bool,
}

impl PublishOptions {
    /// Acknowledged publication
    pub fn acknowledged() -> Self {
        Self {
            acknowledge: true,
            ..Self::default()
        }
    }

    /// Lower into the PUBLISH options dictionary.
    pub fn to_dict(&self) -> Dict {
        let mut dict = Dict::new();
        if self.acknowledge {
            dict.insert("acknowledge".into(), true.into());
        }
        if let Some(exclude_me) = self.exclude_me {
            dict.insert("exclude_me".into(), exclude_me.into());
        }
        if !self.exclude.is_empty() {
            dict.insert("exclude".into(), self.exclude.clone().into());
        }
        if !self.eligible.is_empty() {
            dict.insert("eligible".into(), self.eligible.clone().into());
        }
        if self.disclose_me {
            dict.insert("disclose_me".into(), true.into());
        }
        dict
    }
}

/// Options for `subscribe`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Topic matching policy
    pub match_policy: MatchPolicy,
}

impl SubscribeOptions {
    /// Lower into the SUBSCRIBE options dictionary.
    pub fn to_dict(&self) -> Dict {
        let mut dict = Dict::new();
        if let Some(policy) = self.match_policy.as_option() {
            dict.insert("match".into(), policy.into());
        }
        dict
    }
}

/// Options for `register`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterOptions {
    /// Procedure matching policy
    pub match_policy: MatchPolicy,
    /// Shared registration policy
    pub invoke: Option<InvokePolicy>,
    /// Ask the router to disclose caller identity
    pub disclose_caller: bool,
}

impl RegisterOptions {
    /// Lower into the REGISTER options dictionary.
    pub fn to_dict(&self) -> Dict {
        let mut dict = Dict::new();
        if let Some(policy) = self.match_policy.as_option() {
            dict.insert("match".into(), policy.into());
        }
        if let Some(invoke) = self.invoke {
            dict.insert("invoke".into(), invoke.as_str().into());
        }
        if self.disclose_caller {
            dict.insert("disclose_caller".into(), true.into());
        }
        dict
    }
}

/// Options for `call`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    /// Router-side call timeout
    pub timeout: Option<Duration>,
    /// Opt in to progressive results
    pub receive_progress: bool,
    /// Disclose caller identity
    pub disclose_me: bool,
    /// Mode used by `OutgoingCall::cancel`
    pub cancel_mode: CancelMode,
}

impl CallOptions {
    /// Call options requesting progressive results
    pub fn progressive() -> Self {
        Self {
            receive_progress: true,
            ..Self::default()
        }
    }

    /// Lower into the CALL options dictionary.
    ///
    /// The cancel mode stays local; it is sent with CANCEL.
    pub fn to_dict(&self) -> Dict {
        let mut dict = Dict::new();
        if let Some(timeout) = self.timeout {
            dict.insert("timeout".into(), (timeout.as_millis() as u64).into());
        }
        if self.receive_progress {
            dict.insert("receive_progress".into(), true.into());
        }
        if self.disclose_me {
            dict.insert("disclose_me".into(), true.into());
        }
        dict
    }
}

/// Payload of a call result, yield or error: positional plus keyword arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    /// Positional values
    pub args: List,
    /// Keyword values
    pub kwargs: Dict,
}

impl CallResult {
    /// Empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Result with positional values
    pub fn with_args(args: List) -> Self {
        Self {
            args,
            kwargs: Dict::new(),
        }
    }

    /// Result with a single positional value
    pub fn value(value: impl Into<Value>) -> Self {
        Self::with_args(vec![value.into()])
    }

    /// Attach keyword values
    pub fn kwargs(mut self, kwargs: Dict) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Details delivered with every event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetails {
    /// Publication id
    pub publication: Id,
    /// Concrete topic (differs from the subscription for pattern subscriptions)
    pub topic: Uri,
    /// Publisher session id, when disclosed
    pub publisher: Option<Id>,
    /// Remaining details
    pub extra: Dict,
}

impl EventDetails {
    /// Lift EVENT details, defaulting `topic` to the subscribed topic.
    pub fn from_event(publication: Id, mut details: Dict, subscribed_topic: &str) -> Self {
        let topic = take_string(&mut details, "topic").unwrap_or_else(|| subscribed_topic.into());
        let publisher = details.remove("publisher").and_then(|v| v.as_u64());
        Self {
            publication,
            topic,
            publisher,
            extra: details,
        }
    }
}

/// Details delivered with every invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationDetails {
    /// Concrete procedure (differs from the registration for pattern registrations)
    pub procedure: Uri,
    /// Caller session id, when disclosed
    pub caller: Option<Id>,
    /// Caller asked for progressive results
    pub receive_progress: bool,
    /// Router-side timeout
    pub timeout: Option<Duration>,
    /// Remaining details
    pub extra: Dict,
}

impl InvocationDetails {
    /// Lift INVOCATION details, defaulting `procedure` to the registered URI.
    pub fn from_invocation(mut details: Dict, registered: &str) -> Self {
        let procedure = take_string(&mut details, "procedure").unwrap_or_else(|| registered.into());
        let caller = details.remove("caller").and_then(|v| v.as_u64());
        let receive_progress = details
            .remove("receive_progress")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let timeout = details
            .remove("timeout")
            .and_then(|v| v.as_u64())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Self {
            procedure,
            caller,
            receive_progress,
            timeout,
            extra: details,
        }
    }
}

/// Details of an established session.
#[derive(Debug, Clone, PartialEq)]
pub struct WelcomeDetails {
    /// Router-assigned session id
    pub session: Id,
    /// Authenticated id
    pub authid: Option<String>,
    /// Authenticated role
    pub authrole: Option<String>,
    /// Method that authenticated the session
    pub authmethod: Option<String>,
    /// Router roles and their features
    pub roles: Dict,
    /// Remaining details
    pub extra: Dict,
}

impl WelcomeDetails {
    /// Lift WELCOME details.
    pub fn from_welcome(session: Id, mut details: Dict) -> Self {
        let roles = match details.remove("roles") {
            Some(Value::Object(roles)) => roles,
            _ => Dict::new(),
        };
        Self {
            session,
            authid: take_string(&mut details, "authid"),
            authrole: take_string(&mut details, "authrole"),
            authmethod: take_string(&mut details, "authmethod"),
            roles,
            extra: details,
        }
    }
}

fn take_string(details: &mut Dict, key: &str) -> Option<String> {
    match details.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(value: Value) -> Dict {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_publish_options() {
        assert!(PublishOptions::default().to_dict().is_empty());
        let options = PublishOptions {
            acknowledge: true,
            exclude_me: Some(false),
            exclude: vec![5],
            ..PublishOptions::default()
        };
        assert_eq!(
            Value::Object(options.to_dict()),
            json!({"acknowledge": true, "exclude_me": false, "exclude": [5]})
        );
    }

    #[test]
    fn test_match_policy_lowering() {
        assert!(SubscribeOptions::default().to_dict().is_empty());
        let options = RegisterOptions {
            match_policy: MatchPolicy::Wildcard,
            invoke: Some(InvokePolicy::RoundRobin),
            disclose_caller: false,
        };
        assert_eq!(
            Value::Object(options.to_dict()),
            json!({"match": "wildcard", "invoke": "roundrobin"})
        );
    }

    #[test]
    fn test_call_options_keep_cancel_mode_local() {
        let options = CallOptions {
            timeout: Some(Duration::from_secs(2)),
            receive_progress: true,
            disclose_me: false,
            cancel_mode: CancelMode::KillNoWait,
        };
        assert_eq!(
            Value::Object(options.to_dict()),
            json!({"timeout": 2000, "receive_progress": true})
        );
        assert_eq!(options.cancel_mode.as_str(), "killnowait");
    }

    #[test]
    fn test_event_details_default_topic() {
        let details = EventDetails::from_event(9, Dict::new(), "com.example.topic");
        assert_eq!(details.topic, "com.example.topic");
        assert_eq!(details.publisher, None);

        let details = EventDetails::from_event(
            9,
            dict(json!({"topic": "com.example.other", "publisher": 3, "retained": true})),
            "com.example",
        );
        assert_eq!(details.topic, "com.example.other");
        assert_eq!(details.publisher, Some(3));
        assert_eq!(Value::Object(details.extra), json!({"retained": true}));
    }

    #[test]
    fn test_invocation_details() {
        let details = InvocationDetails::from_invocation(
            dict(json!({"receive_progress": true, "timeout": 500, "caller": 12})),
            "com.example.proc",
        );
        assert_eq!(details.procedure, "com.example.proc");
        assert!(details.receive_progress);
        assert_eq!(details.timeout, Some(Duration::from_millis(500)));
        assert_eq!(details.caller, Some(12));
        assert!(details.extra.is_empty());
    }

    #[test]
    fn test_welcome_details() {
        let details = WelcomeDetails::from_welcome(
            77,
            dict(json!({"authid": "joe", "authrole": "user", "roles": {"broker": {}}, "x": 1})),
        );
        assert_eq!(details.session, 77);
        assert_eq!(details.authid.as_deref(), Some("joe"));
        assert_eq!(details.authmethod, None);
        assert!(details.roles.contains_key("broker"));
        assert_eq!(Value::Object(details.extra), json!({"x": 1}));
    }
}
