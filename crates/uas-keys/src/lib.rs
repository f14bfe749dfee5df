pub mod doctor;
pub mod keys;

pub use keys::{KeyConfig, SharedKey};
