//! Identifier generation.
//!
//! Two independent streams: random global-scope ids and a per-session
//! sequence for request ids. Both stay within `1..=2^53` so they survive
//! codecs that store numbers as doubles.

use rand::Rng;

use super::Id;

/// Largest id allowed by the protocol (2^53).
pub const MAX_ID: Id = 1 << 53;

/// Source of protocol ids
pub trait IdGenerator: Send {
    /// Next id, always in `1..=MAX_ID`
    fn next_id(&mut self) -> Id;
}

/// Uniformly random ids over the full global scope.
#[derive(Debug, Default)]
pub struct GlobalIdGenerator;

impl IdGenerator for GlobalIdGenerator {
    fn next_id(&mut self) -> Id {
        rand::thread_rng().gen_range(1..=MAX_ID)
    }
}

/// Monotonic session-scoped ids starting at 1.
#[derive(Debug)]
pub struct SessionIdGenerator {
    next: Id,
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdGenerator for SessionIdGenerator {
    fn next_id(&mut self) -> Id {
        let id = self.next;
        self.next = if id >= MAX_ID { 1 } else { id + 1 };
        id
    }
}

/// Both generators for one established session.
///
/// Re-created on every WELCOME so request ids restart at 1.
#[derive(Debug, Default)]
pub struct IdGenerators {
    /// Global scope ids
    pub global: GlobalIdGenerator,
    /// Request ids
    pub session: SessionIdGenerator,
}
