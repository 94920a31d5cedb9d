//! SMTP hooks

pub mod spf;

pub use spf::{received_spf_header, SpfHook};
