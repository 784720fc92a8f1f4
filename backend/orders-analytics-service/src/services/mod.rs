pub mod cdc;

pub use cdc::{CdcConsumer, MutationApplier, PgOrderStore};
