//! XVM Types - shared type definitions for the XVM contract engine.
//!
//! - Content digests of contract bytecode
//! - Contract descriptors and runtime tags
//! - Resource limits and usage
//! - Contract responses and events

pub mod descriptor;
pub mod digest;
pub mod error;
pub mod limits;
pub mod response;

pub use descriptor::{validate_contract_name, ContractDescriptor, RuntimeTag};
pub use digest::Digest;
pub use error::TypesError;
pub use limits::{Limits, Resource};
pub use response::{ContractEvent, Response, STATUS_ERROR, STATUS_ERROR_THRESHOLD, STATUS_OK};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ContractDescriptor, ContractEvent, Digest, Limits, Response, RuntimeTag, TypesError,
    };
}
