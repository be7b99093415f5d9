//! LaWallet card module: turns an NXP NTAG 424 DNA card into a
//! self-sovereign Lightning payment instrument.
//!
//! Every tap of a provisioned card yields a URL with two opaque blobs:
//! `p`, the AES-encrypted PICC datagram (UID + monotonic counter), and
//! `c`, the SDMMAC authentication tag. This crate validates those taps,
//! authorizes withdrawals under per-holder spending limits and a NIP-26
//! delegation, and publishes signed transfer instructions onto a Nostr
//! event bus. It never moves funds itself.
//!
//! # Subsystems
//!
//! - [`sun`] — SUN cryptographic verifier for the `p`/`c` pair.
//! - [`store`] — the card registry: NTAGs, cards, holders, delegations,
//!   limits, payments, reset tokens, behind a transactional trait.
//! - [`limits`] — sliding-window spending allowance.
//! - [`payment_request`] — single-use `k1` scan tokens.
//! - [`lifecycle`] — initialize / associate / activate / transfer / admin
//!   reset transitions.
//! - [`config_channel`] — encrypted card-data and card-config documents.
//! - [`withdraw`] — LNURL-withdraw scan and pay flows.
//! - [`subscription`] — inbound config-change consumer with a persisted
//!   high-watermark.
//! - [`nostr`] — event model, NIP-04, NIP-26, and the signed-event
//!   preflight.
//! - [`handlers`] — the axum HTTP surface.
//! - [`outbox`] — the event-bus seam (publish + subscribe traits).
//! - [`ledger`] / [`identity`] — external balance and identity services.
//! - [`config`] / [`app`] — environment configuration and the shared
//!   application context.

pub mod app;
pub mod config;
pub mod config_channel;
pub mod handlers;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod limits;
pub mod nostr;
pub mod outbox;
pub mod payment_request;
pub mod store;
pub mod subscription;
pub mod sun;
pub mod suuid;
pub mod timestamp;
pub mod types;
pub mod withdraw;

#[cfg(test)]
pub mod testing;
