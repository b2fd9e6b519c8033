//! Big segment synchronization engine.
//!
//! A big segment is a segment whose membership is too large to distribute
//! through ordinary streamed flag updates. Its membership lives in an
//! external store (Redis or DynamoDB) shared by every process serving the
//! same environment, and is kept current by a per-environment background
//! synchronizer that combines an initial catch-up poll with a long-lived
//! server-sent-event stream.
//!
//! Consistency is enforced with a single optimistic-concurrency rule: a
//! patch is applied only when the store's current cursor equals the patch's
//! `previousVersion`. Anything else is rejected and the synchronizer falls
//! back to polling from the stored cursor.

pub mod dynamodb_store;
pub mod patch;
pub mod redis_store;
pub mod store;
pub mod synchronizer;

#[cfg(test)]
pub(crate) mod testutils;
