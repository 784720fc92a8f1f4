//! CDC consumer keeping the `orders_analytics` table eventually consistent
//! with the upstream orders table.
//!
//! Debezium publishes row-change events for `orders` to a Kafka topic; this
//! service pulls them one at a time, decodes the envelope, applies the
//! entity-level effect (upsert, delete, or no-op) to PostgreSQL, and only
//! then advances the consumer-group offset. Delivery is at-least-once and
//! both mutations are idempotent, so replay after a crash converges to the
//! same store state.

pub mod config;
pub mod error;
pub mod services;
