pub mod idempotency;
pub mod text;
