//! In-memory registry of connected members.

mod connection;

pub use connection::{
    ConnectionRegistry, InboundStream, MemberConnection, MemberRegistration, MemberSession,
    RegistryError,
};
