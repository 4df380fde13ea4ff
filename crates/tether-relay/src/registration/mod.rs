//! Lease registration: Register, `CheckRegistration` and Deregister.

mod service;


pub use service::{RegistrationError, RegistrationService, validate_registration};
