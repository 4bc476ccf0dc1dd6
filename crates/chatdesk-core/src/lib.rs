pub mod chat;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod lifecycle;

pub use errors::ChatError;
