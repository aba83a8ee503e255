//! Command rate limiting.

mod bin;
mod gate;
mod key;

pub use bin::{KeyPart, TokenBin};
pub use gate::{Admission, CommandGate};
pub use key::BucketKey;
