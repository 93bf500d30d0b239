pub mod store;

pub use store::SqliteExecutionStore;
