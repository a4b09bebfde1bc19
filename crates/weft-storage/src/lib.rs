// Postgres storage layer with sqlx

pub mod encryption;
pub mod models;
pub mod repositories;

pub use encryption::{generate_key, SecretCipher};
pub use models::*;
pub use repositories::{Database, CREDENTIALS_CHANNEL};
