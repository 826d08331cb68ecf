//! Protocol messages for WAMP sessions.
//!
//! Defines the abstract message vocabulary and its array wire form
//! (`[code, field, ...]`) shared by every codec.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use super::{Dict, Id, List, Uri};
use crate::error::{DomainError, Result, WampError};

/// Message types in the WAMP protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Session open request
    Hello,
    /// Session accepted
    Welcome,
    /// Session rejected or aborted
    Abort,
    /// Authentication challenge
    Challenge,
    /// Authentication response
    Authenticate,
    /// Session close
    Goodbye,
    /// Error reply to a request
    Error,
    /// Publish an event
    Publish,
    /// Publication acknowledged
    Published,
    /// Subscribe to a topic
    Subscribe,
    /// Subscription acknowledged
    Subscribed,
    /// Remove a subscription
    Unsubscribe,
    /// Subscription removed or revoked
    Unsubscribed,
    /// Event delivery
    Event,
    /// Call a procedure
    Call,
    /// Cancel a call
    Cancel,
    /// Call result (possibly progressive)
    Result,
    /// Register a procedure
    Register,
    /// Registration acknowledged
    Registered,
    /// Remove a registration
    Unregister,
    /// Registration removed or revoked
    Unregistered,
    /// Invocation of a registered procedure
    Invocation,
    /// Interrupt a running invocation
    Interrupt,
    /// Invocation result (possibly progressive)
    Yield,
}

impl MessageKind {
    const ALL: [MessageKind; 24] = [
        MessageKind::Hello,
        MessageKind::Welcome,
        MessageKind::Abort,
        MessageKind::Challenge,
        MessageKind::Authenticate,
        MessageKind::Goodbye,
        MessageKind::Error,
        MessageKind::Publish,
        MessageKind::Published,
        MessageKind::Subscribe,
        MessageKind::Subscribed,
        MessageKind::Unsubscribe,
        MessageKind::Unsubscribed,
        MessageKind::Event,
        MessageKind::Call,
        MessageKind::Cancel,
        MessageKind::Result,
        MessageKind::Register,
        MessageKind::Registered,
        MessageKind::Unregister,
        MessageKind::Unregistered,
        MessageKind::Invocation,
        MessageKind::Interrupt,
        MessageKind::Yield,
    ];

    /// Numeric message code on the wire.
    pub fn code(self) -> u64 {
        match self {
            Self::Hello => 1,
            Self::Welcome => 2,
            Self::Abort => 3,
            Self::Challenge => 4,
            Self::Authenticate => 5,
            Self::Goodbye => 6,
            Self::Error => 8,
            Self::Publish => 16,
            Self::Published => 17,
            Self::Subscribe => 32,
            Self::Subscribed => 33,
            Self::Unsubscribe => 34,
            Self::Unsubscribed => 35,
            Self::Event => 36,
            Self::Call => 48,
            Self::Cancel => 49,
            Self::Result => 50,
            Self::Register => 64,
            Self::Registered => 65,
            Self::Unregister => 66,
            Self::Unregistered => 67,
            Self::Invocation => 68,
            Self::Interrupt => 69,
            Self::Yield => 70,
        }
    }

    /// Look up a kind by its wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Upper-case protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Abort => "ABORT",
            Self::Challenge => "CHALLENGE",
            Self::Authenticate => "AUTHENTICATE",
            Self::Goodbye => "GOODBYE",
            Self::Error => "ERROR",
            Self::Publish => "PUBLISH",
            Self::Published => "PUBLISHED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Subscribed => "SUBSCRIBED",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsubscribed => "UNSUBSCRIBED",
            Self::Event => "EVENT",
            Self::Call => "CALL",
            Self::Cancel => "CANCEL",
            Self::Result => "RESULT",
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Unregister => "UNREGISTER",
            Self::Unregistered => "UNREGISTERED",
            Self::Invocation => "INVOCATION",
            Self::Interrupt => "INTERRUPT",
            Self::Yield => "YIELD",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[HELLO, Realm|uri, Details|dict]`
    Hello {
        /// Realm to join
        realm: Uri,
        /// Roles, agent and auth details
        details: Dict,
    },
    /// `[WELCOME, Session|id, Details|dict]`
    Welcome {
        /// Router-assigned session id
        session: Id,
        /// Router roles and auth details
        details: Dict,
    },
    /// `[ABORT, Details|dict, Reason|uri]`
    Abort {
        /// Abort details
        details: Dict,
        /// Abort reason
        reason: Uri,
    },
    /// `[CHALLENGE, AuthMethod|string, Extra|dict]`
    Challenge {
        /// Authentication method being challenged
        auth_method: String,
        /// Challenge parameters
        extra: Dict,
    },
    /// `[AUTHENTICATE, Signature|string, Extra|dict]`
    Authenticate {
        /// Computed signature
        signature: String,
        /// Additional details
        extra: Dict,
    },
    /// `[GOODBYE, Details|dict, Reason|uri]`
    Goodbye {
        /// Goodbye details
        details: Dict,
        /// Close reason
        reason: Uri,
    },
    /// `[ERROR, REQUEST.Type|int, REQUEST.Request|id, Details|dict, Error|uri, Arguments|list, ArgumentsKw|dict]`
    Error {
        /// Kind of the request this error answers
        request_type: MessageKind,
        /// Request id
        request: Id,
        /// Error details
        details: Dict,
        /// Error URI
        error: Uri,
        /// Positional arguments
        args: List,
        /// Keyword arguments
        kwargs: Dict,
    },
    /// `[PUBLISH, Request|id, Options|dict, Topic|uri, Arguments|list, ArgumentsKw|dict]`
    Publish {
        /// Request id
        request: Id,
        /// Publish options
        options: Dict,
        /// Topic
        topic: Uri,
        /// Positional arguments
        args: List,
        /// Keyword arguments
        kwargs: Dict,
    },
    /// `[PUBLISHED, PUBLISH.Request|id, Publication|id]`
    Published {
        /// Request id
        request: Id,
        /// Publication id
        publication: Id,
    },
    /// `[SUBSCRIBE, Request|id, Options|dict, Topic|uri]`
    Subscribe {
        /// Request id
        request: Id,
        /// Subscribe options
        options: Dict,
        /// Topic
        topic: Uri,
    },
    /// `[SUBSCRIBED, SUBSCRIBE.Request|id, Subscription|id]`
    Subscribed {
        /// Request id
        request: Id,
        /// Router subscription id
        subscription: Id,
    },
    /// `[UNSUBSCRIBE, Request|id, SUBSCRIBED.Subscription|id]`
    Unsubscribe {
        /// Request id
        request: Id,
        /// Router subscription id
        subscription: Id,
    },
    /// `[UNSUBSCRIBED, UNSUBSCRIBE.Request|id, Details|dict?]`
    Unsubscribed {
        /// Request id (0 for router-initiated revocation)
        request: Id,
        /// Revocation details
        details: Option<Dict>,
    },
    /// `[EVENT, SUBSCRIBED.Subscription|id, PUBLISHED.Publication|id, Details|dict, Arguments|list, ArgumentsKw|dict]`
    Event {
        /// Router subscription id
        subscription: Id,
        /// Publication id
        publication: Id,
        /// Event details
        details: Dict,
        /// Positional arguments
        args: List,
        /// Keyword arguments
        kwargs: Dict,
    },
    /// `[CALL, Request|id, Options|dict, Procedure|uri, Arguments|list, ArgumentsKw|dict]`
    Call {
        /// Request id
        request: Id,
        /// Call options
        options: Dict,
        /// Procedure
        procedure: Uri,
        /// Positional arguments
        args: List,
        /// Keyword arguments
        kwargs: Dict,
    },
    /// `[CANCEL, CALL.Request|id, Options|dict]`
    Cancel {
        /// Call request id
        request: Id,
        /// Cancel options (mode)
        options: Dict,
    },
    /// `[RESULT, CALL.Request|id, Details|dict, Arguments|list, ArgumentsKw|dict]`
    Result {
        /// Call request id
        request: Id,
        /// Result details (progress flag)
        details: Dict,
        /// Positional results
        args: List,
        /// Keyword results
        kwargs: Dict,
    },
    /// `[REGISTER, Request|id, Options|dict, Procedure|uri]`
    Register {
        /// Request id
        request: Id,
        /// Register options
        options: Dict,
        /// Procedure
        procedure: Uri,
    },
    /// `[REGISTERED, REGISTER.Request|id, Registration|id]`
    Registered {
        /// Request id
        request: Id,
        /// Router registration id
        registration: Id,
    },
    /// `[UNREGISTER, Request|id, REGISTERED.Registration|id]`
    Unregister {
        /// Request id
        request: Id,
        /// Router registration id
        registration: Id,
    },
    /// `[UNREGISTERED, UNREGISTER.Request|id, Details|dict?]`
    Unregistered {
        /// Request id (0 for router-initiated revocation)
        request: Id,
        /// Revocation details
        details: Option<Dict>,
    },
    /// `[INVOCATION, Request|id, REGISTERED.Registration|id, Details|dict, Arguments|list, ArgumentsKw|dict]`
    Invocation {
        /// Invocation request id
        request: Id,
        /// Router registration id
        registration: Id,
        /// Invocation details
        details: Dict,
        /// Positional arguments
        args: List,
        /// Keyword arguments
        kwargs: Dict,
    },
    /// `[INTERRUPT, INVOCATION.Request|id, Options|dict]`
    Interrupt {
        /// Invocation request id
        request: Id,
        /// Interrupt options (mode)
        options: Dict,
    },
    /// `[YIELD, INVOCATION.Request|id, Options|dict, Arguments|list, ArgumentsKw|dict]`
    Yield {
        /// Invocation request id
        request: Id,
        /// Yield options (progress flag)
        options: Dict,
        /// Positional results
        args: List,
        /// Keyword results
        kwargs: Dict,
    },
}

impl Message {
    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Abort { .. } => MessageKind::Abort,
            Message::Challenge { .. } => MessageKind::Challenge,
            Message::Authenticate { .. } => MessageKind::Authenticate,
            Message::Goodbye { .. } => MessageKind::Goodbye,
            Message::Error { .. } => MessageKind::Error,
            Message::Publish { .. } => MessageKind::Publish,
            Message::Published { .. } => MessageKind::Published,
            Message::Subscribe { .. } => MessageKind::Subscribe,
            Message::Subscribed { .. } => MessageKind::Subscribed,
            Message::Unsubscribe { .. } => MessageKind::Unsubscribe,
            Message::Unsubscribed { .. } => MessageKind::Unsubscribed,
            Message::Event { .. } => MessageKind::Event,
            Message::Call { .. } => MessageKind::Call,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::Result { .. } => MessageKind::Result,
            Message::Register { .. } => MessageKind::Register,
            Message::Registered { .. } => MessageKind::Registered,
            Message::Unregister { .. } => MessageKind::Unregister,
            Message::Unregistered { .. } => MessageKind::Unregistered,
            Message::Invocation { .. } => MessageKind::Invocation,
            Message::Interrupt { .. } => MessageKind::Interrupt,
            Message::Yield { .. } => MessageKind::Yield,
        }
    }

    /// Request id this message carries, if any.
    ///
    /// For ERROR this is the id of the request being answered.
    pub fn request_id(&self) -> Option<Id> {
        match self {
            Message::Error { request, .. }
            | Message::Publish { request, .. }
            | Message::Published { request, .. }
            | Message::Subscribe { request, .. }
            | Message::Subscribed { request, .. }
            | Message::Unsubscribe { request, .. }
            | Message::Unsubscribed { request, .. }
            | Message::Call { request, .. }
            | Message::Cancel { request, .. }
            | Message::Result { request, .. }
            | Message::Register { request, .. }
            | Message::Registered { request, .. }
            | Message::Unregister { request, .. }
            | Message::Unregistered { request, .. }
            | Message::Invocation { request, .. }
            | Message::Interrupt { request, .. }
            | Message::Yield { request, .. } => Some(*request),
            _ => None,
        }
    }

    /// Create an ABORT message
    pub fn abort(reason: &str, message: &str) -> Self {
        Message::Abort {
            details: message_details(message),
            reason: reason.to_string(),
        }
    }

    /// Create a GOODBYE message
    pub fn goodbye(reason: &str, message: &str) -> Self {
        Message::Goodbye {
            details: message_details(message),
            reason: reason.to_string(),
        }
    }

    /// Create an ERROR message answering `request` of kind `request_type`
    pub fn error(request_type: MessageKind, request: Id, err: DomainError) -> Self {
        Message::Error {
            request_type,
            request,
            details: Dict::new(),
            error: err.uri,
            args: err.args,
            kwargs: err.kwargs,
        }
    }

    /// Encode to the array wire form.
    pub fn to_value(&self) -> Value {
        let code = Value::from(self.kind().code());
        let mut items = match self {
            Message::Hello { realm, details } => {
                vec![code, realm.clone().into(), dict(details)]
            },
            Message::Welcome { session, details } => {
                vec![code, (*session).into(), dict(details)]
            },
            Message::Abort { details, reason } | Message::Goodbye { details, reason } => {
                vec![code, dict(details), reason.clone().into()]
            },
            Message::Challenge { auth_method, extra } => {
                vec![code, auth_method.clone().into(), dict(extra)]
            },
            Message::Authenticate { signature, extra } => {
                vec![code, signature.clone().into(), dict(extra)]
            },
            Message::Error {
                request_type,
                request,
                details,
                error,
                ..
            } => vec![
                code,
                request_type.code().into(),
                (*request).into(),
                dict(details),
                error.clone().into(),
            ],
            Message::Publish {
                request,
                options,
                topic,
                ..
            } => vec![code, (*request).into(), dict(options), topic.clone().into()],
            Message::Published {
                request,
                publication,
            } => vec![code, (*request).into(), (*publication).into()],
            Message::Subscribe {
                request,
                options,
                topic,
            } => vec![code, (*request).into(), dict(options), topic.clone().into()],
            Message::Subscribed {
                request,
                subscription,
            }
            | Message::Unsubscribe {
                request,
                subscription,
            } => vec![code, (*request).into(), (*subscription).into()],
            Message::Unsubscribed { request, details }
            | Message::Unregistered { request, details } => {
                let mut items = vec![code, (*request).into()];
                if let Some(details) = details {
                    items.push(dict(details));
                }
                items
            },
            Message::Event {
                subscription,
                publication,
                details,
                ..
            } => vec![
                code,
                (*subscription).into(),
                (*publication).into(),
                dict(details),
            ],
            Message::Call {
                request,
                options,
                procedure,
                ..
            } => vec![
                code,
                (*request).into(),
                dict(options),
                procedure.clone().into(),
            ],
            Message::Cancel { request, options } | Message::Interrupt { request, options } => {
                vec![code, (*request).into(), dict(options)]
            },
            Message::Result {
                request, details, ..
            } => vec![code, (*request).into(), dict(details)],
            Message::Register {
                request,
                options,
                procedure,
            } => vec![
                code,
                (*request).into(),
                dict(options),
                procedure.clone().into(),
            ],
            Message::Registered {
                request,
                registration,
            }
            | Message::Unregister {
                request,
                registration,
            } => vec![code, (*request).into(), (*registration).into()],
            Message::Invocation {
                request,
                registration,
                details,
                ..
            } => vec![
                code,
                (*request).into(),
                (*registration).into(),
                dict(details),
            ],
            Message::Yield {
                request, options, ..
            } => vec![code, (*request).into(), dict(options)],
        };

        if let Some((args, kwargs)) = self.payload() {
            if !kwargs.is_empty() {
                items.push(Value::Array(args.clone()));
                items.push(Value::Object(kwargs.clone()));
            } else if !args.is_empty() {
                items.push(Value::Array(args.clone()));
            }
        }

        Value::Array(items)
    }

    /// Decode from the array wire form.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(malformed("message", "not an array"));
        };
        let code = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("message", "missing message code"))?;
        let kind = MessageKind::from_code(code)
            .ok_or_else(|| malformed("message", &format!("unknown message code {code}")))?;
        let fields = Fields { kind, items };

        let message = match kind {
            MessageKind::Hello => Message::Hello {
                realm: fields.string(1)?,
                details: fields.dict(2)?,
            },
            MessageKind::Welcome => Message::Welcome {
                session: fields.id(1)?,
                details: fields.dict(2)?,
            },
            MessageKind::Abort => Message::Abort {
                details: fields.dict(1)?,
                reason: fields.string(2)?,
            },
            MessageKind::Challenge => Message::Challenge {
                auth_method: fields.string(1)?,
                extra: fields.opt_dict(2)?,
            },
            MessageKind::Authenticate => Message::Authenticate {
                signature: fields.string(1)?,
                extra: fields.opt_dict(2)?,
            },
            MessageKind::Goodbye => Message::Goodbye {
                details: fields.dict(1)?,
                reason: fields.string(2)?,
            },
            MessageKind::Error => {
                let code = fields.id(1)?;
                let request_type = MessageKind::from_code(code).ok_or_else(|| {
                    malformed("ERROR", &format!("unknown request type {code}"))
                })?;
                Message::Error {
                    request_type,
                    request: fields.id(2)?,
                    details: fields.dict(3)?,
                    error: fields.string(4)?,
                    args: fields.opt_list(5)?,
                    kwargs: fields.opt_dict(6)?,
                }
            },
            MessageKind::Publish => Message::Publish {
                request: fields.id(1)?,
                options: fields.dict(2)?,
                topic: fields.string(3)?,
                args: fields.opt_list(4)?,
                kwargs: fields.opt_dict(5)?,
            },
            MessageKind::Published => Message::Published {
                request: fields.id(1)?,
                publication: fields.id(2)?,
            },
            MessageKind::Subscribe => Message::Subscribe {
                request: fields.id(1)?,
                options: fields.dict(2)?,
                topic: fields.string(3)?,
            },
            MessageKind::Subscribed => Message::Subscribed {
                request: fields.id(1)?,
                subscription: fields.id(2)?,
            },
            MessageKind::Unsubscribe => Message::Unsubscribe {
                request: fields.id(1)?,
                subscription: fields.id(2)?,
            },
            MessageKind::Unsubscribed => Message::Unsubscribed {
                request: fields.id(1)?,
                details: fields.maybe_dict(2)?,
            },
            MessageKind::Event => Message::Event {
                subscription: fields.id(1)?,
                publication: fields.id(2)?,
                details: fields.dict(3)?,
                args: fields.opt_list(4)?,
                kwargs: fields.opt_dict(5)?,
            },
            MessageKind::Call => Message::Call {
                request: fields.id(1)?,
                options: fields.dict(2)?,
                procedure: fields.string(3)?,
                args: fields.opt_list(4)?,
                kwargs: fields.opt_dict(5)?,
            },
            MessageKind::Cancel => Message::Cancel {
                request: fields.id(1)?,
                options: fields.opt_dict(2)?,
            },
            MessageKind::Result => Message::Result {
                request: fields.id(1)?,
                details: fields.dict(2)?,
                args: fields.opt_list(3)?,
                kwargs: fields.opt_dict(4)?,
            },
            MessageKind::Register => Message::Register {
                request: fields.id(1)?,
                options: fields.dict(2)?,
                procedure: fields.string(3)?,
            },
            MessageKind::Registered => Message::Registered {
                request: fields.id(1)?,
                registration: fields.id(2)?,
            },
            MessageKind::Unregister => Message::Unregister {
                request: fields.id(1)?,
                registration: fields.id(2)?,
            },
            MessageKind::Unregistered => Message::Unregistered {
                request: fields.id(1)?,
                details: fields.maybe_dict(2)?,
            },
            MessageKind::Invocation => Message::Invocation {
                request: fields.id(1)?,
                registration: fields.id(2)?,
                details: fields.dict(3)?,
                args: fields.opt_list(4)?,
                kwargs: fields.opt_dict(5)?,
            },
            MessageKind::Interrupt => Message::Interrupt {
                request: fields.id(1)?,
                options: fields.opt_dict(2)?,
            },
            MessageKind::Yield => Message::Yield {
                request: fields.id(1)?,
                options: fields.dict(2)?,
                args: fields.opt_list(3)?,
                kwargs: fields.opt_dict(4)?,
            },
        };

        Ok(message)
    }

    fn payload(&self) -> Option<(&List, &Dict)> {
        match self {
            Message::Error { args, kwargs, .. }
            | Message::Publish { args, kwargs, .. }
            | Message::Event { args, kwargs, .. }
            | Message::Call { args, kwargs, .. }
            | Message::Result { args, kwargs, .. }
            | Message::Invocation { args, kwargs, .. }
            | Message::Yield { args, kwargs, .. } => Some((args, kwargs)),
            _ => None,
        }
    }
}

/// A message that does not match its kind's array layout.
#[derive(Debug, Error)]
#[error("malformed {kind}: {reason}")]
pub struct MalformedMessage {
    kind: String,
    reason: String,
}

fn malformed(kind: &str, reason: &str) -> WampError {
    WampError::serialization(MalformedMessage {
        kind: kind.to_string(),
        reason: reason.to_string(),
    })
}

fn message_details(message: &str) -> Dict {
    let mut details = Dict::new();
    if !message.is_empty() {
        details.insert("message".to_string(), message.into());
    }
    details
}

fn dict(d: &Dict) -> Value {
    Value::Object(d.clone())
}

struct Fields {
    kind: MessageKind,
    items: Vec<Value>,
}

impl Fields {
    fn field(&self, index: usize) -> Result<&Value> {
        self.items
            .get(index)
            .ok_or_else(|| malformed(self.kind.name(), &format!("missing field {index}")))
    }

    fn id(&self, index: usize) -> Result<Id> {
        self.field(index)?
            .as_u64()
            .ok_or_else(|| malformed(self.kind.name(), &format!("field {index} is not an id")))
    }

    fn string(&self, index: usize) -> Result<String> {
        self.field(index)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| malformed(self.kind.name(), &format!("field {index} is not a string")))
    }

    fn dict(&self, index: usize) -> Result<Dict> {
        match self.field(index)? {
            Value::Object(map) => Ok(map.clone()),
            _ => Err(malformed(
                self.kind.name(),
                &format!("field {index} is not a dict"),
            )),
        }
    }

    fn maybe_dict(&self, index: usize) -> Result<Option<Dict>> {
        match self.items.get(index) {
            None => Ok(None),
            Some(_) => self.dict(index).map(Some),
        }
    }

    fn opt_dict(&self, index: usize) -> Result<Dict> {
        Ok(self.maybe_dict(index)?.unwrap_or_default())
    }

    fn opt_list(&self, index: usize) -> Result<List> {
        match self.items.get(index) {
            None => Ok(List::new()),
            Some(Value::Array(list)) => Ok(list.clone()),
            Some(_) => Err(malformed(
                self.kind.name(),
                &format!("field {index} is not a list"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_codes() {
        assert_eq!(MessageKind::Hello.code(), 1);
        assert_eq!(MessageKind::Error.code(), 8);
        assert_eq!(MessageKind::Yield.code(), 70);
        assert_eq!(MessageKind::from_code(36), Some(MessageKind::Event));
        assert_eq!(MessageKind::from_code(7), None);
        assert_eq!(MessageKind::Unsubscribed.to_string(), "UNSUBSCRIBED");
    }

    #[test]
    fn test_call_wire_form_omits_empty_payload() {
        let msg = Message::Call {
            request: 7,
            options: Dict::new(),
            procedure: "com.example.add".to_string(),
            args: List::new(),
            kwargs: Dict::new(),
        };
        assert_eq!(msg.to_value(), json!([48, 7, {}, "com.example.add"]));

        let msg = Message::Call {
            request: 7,
            options: Dict::new(),
            procedure: "com.example.add".to_string(),
            args: List::new(),
            kwargs: json!({"a": 1}).as_object().unwrap().clone(),
        };
        assert_eq!(
            msg.to_value(),
            json!([48, 7, {}, "com.example.add", [], {"a": 1}])
        );
    }

    #[test]
    fn test_decode_error_message() {
        let msg = Message::from_value(json!([8, 48, 12, {}, "com.example.error", ["bad"]]))
            .unwrap();
        match msg {
            Message::Error {
                request_type,
                request,
                error,
                args,
                kwargs,
                ..
            } => {
                assert_eq!(request_type, MessageKind::Call);
                assert_eq!(request, 12);
                assert_eq!(error, "com.example.error");
                assert_eq!(args, vec![json!("bad")]);
                assert!(kwargs.is_empty());
            },
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_revocation_without_details() {
        let msg = Message::from_value(json!([35, 4])).unwrap();
        assert_eq!(
            msg,
            Message::Unsubscribed {
                request: 4,
                details: None
            }
        );
        assert_eq!(msg.request_id(), Some(4));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Message::from_value(json!({"type": 1}))
            .unwrap_err()
            .is_serialization());
        assert!(Message::from_value(json!([99, 1])).unwrap_err().is_serialization());
        assert!(Message::from_value(json!([33, "x", 1]))
            .unwrap_err()
            .is_serialization());
        assert!(Message::from_value(json!([36, 1, 2, {}, "not-a-list"]))
            .unwrap_err()
            .is_serialization());
    }

    #[test]
    fn test_abort_and_goodbye_details() {
        let abort = Message::abort("wamp.error.protocol_violation", "unexpected RESULT");
        assert_eq!(
            abort.to_value(),
            json!([3, {"message": "unexpected RESULT"}, "wamp.error.protocol_violation"])
        );
        let goodbye = Message::goodbye("wamp.close.normal", "");
        assert_eq!(goodbye.to_value(), json!([6, {}, "wamp.close.normal"]));
        assert_eq!(goodbye.request_id(), None);
    }
}
