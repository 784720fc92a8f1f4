use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Process-level failures.
///
/// Connection errors at startup are fatal. Everything recoverable
/// (transient broker errors, malformed records, poison-pill data) is
/// handled inside the consumer loop and never reaches this type; the one
/// runtime variant is `StoreUnavailable`, raised after bounded retry so the
/// loop halts without committing the offset.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("analytics store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}
