//! CRDs owned by other projects, which the operator only consumes.

pub mod cert_manager;
