//! lxce: a lightweight, non-OCI container engine
//! Contained spaces are long-lived namespace sandboxes with their own rootfs;
//! contained apps are processes started inside them on request.

pub mod action;
pub mod capability;
pub mod capp;
pub mod capp_runtime;
pub mod cli;
pub mod cspace;
pub mod engine;
pub mod factory;
pub mod ipc;
pub mod mailbox;
pub mod manager;
pub mod mount_jail;
pub mod network;
pub mod protocol;
pub mod signal;
pub mod space_thread;
pub mod types;
pub mod userns;

pub use types::{LxceError, Result};
