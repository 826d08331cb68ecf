//! WAMP protocol vocabulary and session state.
//!
//! Implements the message set, options, feature advertisement, identifier
//! generation and handshake state machine used by a WAMP client session.
//!
//! # Protocol Overview
//!
//! A client joins a realm on a router and then acts in up to four roles
//! (publisher, subscriber, caller, callee) over that one session.
//!
//! ## Message Flow
//!
//! ```text
//! Client                            Router
//!    |                                |
//!    |-------- HELLO (roles) ------->|  Join realm, advertise features
//!    |<------- CHALLENGE ------------|  Optional challenge/response
//!    |-------- AUTHENTICATE -------->|
//!    |<------- WELCOME --------------|  Session established
//!    |     or ABORT (reason)         |  or rejected
//!    |                                |
//!    |======= CALL / PUBLISH ... ===>|  Role traffic
//!    |<====== RESULT / EVENT ... ====|
//!    |                                |
//!    |-------- GOODBYE ------------->|  Close
//!    |<------- GOODBYE --------------|
//! ```
//!
//! ## State Machine
//!
//! | State         | Description                        | Valid Transitions          |
//! |---------------|------------------------------------|----------------------------|
//! | `Idle`        | HELLO sent or about to be sent     | → Challenging, Established, Error |
//! | `Challenging` | CHALLENGE received                 | → Idle, Established, Error |
//! | `Established` | Role traffic allowed               | → Closing                  |
//! | `Closing`     | GOODBYE exchange in progress       | → Closed                   |
//! | `Closed`      | Session ended cleanly              | (terminal)                 |
//! | `Error`       | Session aborted                    | (terminal)                 |

mod features;
mod ids;
mod message;
mod options;
mod state;

use lazy_static::lazy_static;
use regex::Regex;

pub use features::Role;
pub use ids::{GlobalIdGenerator, IdGenerator, IdGenerators, SessionIdGenerator, MAX_ID};
pub use message::{MalformedMessage, Message, MessageKind};
pub use options::{
    CallOptions, CallResult, CancelMode, EventDetails, InvocationDetails, InvokePolicy,
    MatchPolicy, PublishOptions, RegisterOptions, SubscribeOptions, WelcomeDetails,
};
pub use state::{next_state, Direction, SessionState, SessionStateMachine};

/// Router-assigned or client-chosen identifier (at most 2^53).
pub type Id = u64;

/// Dotted URI naming a topic, procedure, error or reason.
pub type Uri = String;

/// Options/details dictionary.
pub type Dict = serde_json::Map<String, serde_json::Value>;

/// Positional payload.
pub type List = Vec<serde_json::Value>;

/// Close reason sent with a client-initiated GOODBYE.
pub const CLOSE_NORMAL: &str = "wamp.close.normal";

/// Reply reason to a router-initiated GOODBYE.
pub const CLOSE_GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";

lazy_static! {
    static ref STRICT_URI: Regex =
        Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").expect("valid regex");
    static ref LOOSE_URI: Regex = Regex::new(r"^([^\s\.#]+\.)*([^\s\.#]+)$").expect("valid regex");
    static ref PATTERN_URI: Regex =
        Regex::new(r"^(([^\s\.#]+\.)|\.)*([^\s\.#]+)?$").expect("valid regex");
}

/// Check a URI used for publishing, calling or as an error.
///
/// Accepts the loose form: dot-separated components without whitespace or `#`.
pub fn is_valid_uri(uri: &str) -> bool {
    LOOSE_URI.is_match(uri)
}

/// Check a URI against the strict form (lower-case, digits and underscore).
pub fn is_strict_uri(uri: &str) -> bool {
    STRICT_URI.is_match(uri)
}

/// Check a subscribe/register URI under the given match policy.
///
/// Wildcard patterns may contain empty components (`com..update`).
pub fn is_valid_pattern(uri: &str, policy: MatchPolicy) -> bool {
    match policy {
        MatchPolicy::Wildcard => !uri.is_empty() && PATTERN_URI.is_match(uri),
        MatchPolicy::Exact | MatchPolicy::Prefix => is_valid_uri(uri),
    }
}
