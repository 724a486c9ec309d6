pub mod clickhouse;
pub mod postgres;
pub mod vectors;

pub use clickhouse::StatsStore;
pub use postgres::PgStore;
pub use vectors::VectorStore;
