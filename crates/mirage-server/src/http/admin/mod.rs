//! Admin API: CRUD on stubs, file and proto uploads, capture listing and
//! reset. Thin handlers over the store with a uniform response envelope.

pub mod handlers;
pub mod types;
