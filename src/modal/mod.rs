//! Modal prompt correlation.
//!
//! A handler that shows the user a form issues a token through
//! [`ModalRouter::prompt`]; the platform echoes it back with the filled-in
//! form, and [`ModalRouter::submit`] claims it and routes the answer.

mod router;
mod secrets;

pub use router::{ModalHandler, ModalOutcome, ModalRouter, ModalSubmission, Reply, ACCESS_DENIED, UNHANDLED};
pub use secrets::{Secret, SecretTable};
