//! Workspace root crate. No code of its own; exists so the root
//! `Cargo.toml` package (which carries workspace-level dev-dependencies
//! for integration tests) has a valid target.
