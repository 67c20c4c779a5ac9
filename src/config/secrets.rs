//! Secret handling. Re-exports the secrecy types the crate hands out.

pub use secrecy::{ExposeSecret, SecretString};
