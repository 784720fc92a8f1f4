mod applier;
mod consumer;
mod models;

#[cfg(test)]
mod test_store;

pub use applier::{
    ApplyError, ApplyOutcome, MutationApplier, OrderAnalyticsRow, OrderStore, PgOrderStore,
};
pub use consumer::{CdcConsumer, RetryPolicy};
pub use models::{decode, ChangeEvent, DecodeError, OrderRow};
