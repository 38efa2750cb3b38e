//! `rnfsd`: a user-space NFSv2 and MOUNT v1/v2 server.
//!
//! Module layout follows the component table in spec §2: each file below
//! corresponds to one lettered component, with `rpc`, `nfs`, and `mount`
//! holding the wire-facing layers built on top of them.

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod cred;
pub mod devtable;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod failsafe;
pub mod handle;
pub mod idmap;
pub mod mount;
pub mod nfs;
pub mod psi;
pub mod rebuild;
pub mod resolve;
pub mod rmtab;
pub mod rpc;
pub mod server;
pub mod wire;
