//! At-most-one-successful-execution cache keyed by idempotency key.
//!
//! The first successful run of a key stores a receipt; every later call with
//! that key returns the stored response until the receipt expires. Concurrent
//! first attempts on one key are serialized by a per-key lock, so the handler
//! runs once even when duplicates race.
//!
//! Durability is optional and best-effort: receipts are snapshotted to a
//! [`ReceiptRepository`] on demand and reloaded on startup.

mod locks;
pub mod receipt;
pub mod repository;
pub mod store;

pub use receipt::{IdempotencyReceipt, IdempotencyRequest, IdempotencyStats, IdempotentOutcome};
pub use repository::{MemoryReceiptRepository, PgReceiptRepository, ReceiptRepository};
pub use store::IdempotencyStore;
