//! Citadel core: the sealed barrier, seal subsystem, mount router, policy
//! and token stores, expiration manager, and the composed [`Core`].
//!
//! Layering, leaves first: physical storage (`citadel-storage`, or the
//! replicated store in `citadel-raft`) → [`barrier::Barrier`] (transparent
//! AEAD over everything persisted) → the stores and managers (mounts,
//! policies, tokens, identity, leases) → [`Core`], which owns the seal
//! lifecycle, HA leadership, and the request pipeline the transport calls
//! into.

pub mod audit;
pub mod barrier;
mod core;
pub mod crypto;
pub mod cubbyhole;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod ha;
pub mod identity;
pub mod keyring;
pub mod kv;
pub mod mount;
pub mod policy;
pub mod rekey;
pub mod router;
pub mod seal;
pub mod token;

pub use crate::core::{
    AuthInfo, Core, CoreConfig, CoreResponse, CoreState, GenerateRootOutcome, InitParams,
    InitResult, Request, SealProvider, SealStatusInfo, UnsealOutcome, WrapInfo,
};
