//! Database initialization, migrations and lock retry

pub mod init;
pub mod migrations;
pub mod retry;

pub use init::*;
pub use migrations::run_migrations;
pub use retry::retry_on_lock;
