pub mod accounts;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use accounts::{Account, AccountRepo, AccountRole};
pub use database::Database;
pub use error::StoreError;
pub use sessions::{AppendOutcome, NewMessage, SessionRepo};
