mod database_sync;

pub use database_sync::DatabaseSyncJob;
