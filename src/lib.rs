#![doc = include_str!("../README.md")]

pub mod constant;
mod hasher;
pub mod mem_store;
pub mod node;
pub mod operation;
pub mod persistent;
pub mod proof;
pub mod traits;
pub mod types;

pub use mem_store::MemStore;
pub use operation::{Modification, Operation, OperationError, UpdateOutcome};
pub use persistent::PersistentBatchAvlProver;
pub use proof::{BatchAvlProver, BatchAvlVerifier, ProverError, SerializedProof, VerifierError};
pub use traits::VersionedStorage;
pub use types::*;
