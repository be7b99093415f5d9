//! Event-bus primitives: the signed event model, NIP-04 encryption, the
//! multi-recipient envelope, NIP-26 delegations, and the inbound preflight
//! every signed event passes.

pub mod envelope;
pub mod event;
pub mod nip04;
pub mod nip26;
pub mod preflight;

pub use event::{Event, EventTemplate};
