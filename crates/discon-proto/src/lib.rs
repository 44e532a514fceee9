//! Shared wire protocol for remote DISCON controller calls.
//! Keeping this in a dedicated crate lets the client shim, the sandbox host,
//! and the manager agree on one frame definition without pulling in any of
//! their runtime stacks.

pub mod frame;
pub mod net;
pub mod staging;

pub use frame::{
    Frame, WireError, SWAP_INFILE_LEN, SWAP_MSG_LEN, SWAP_OUTNAME_LEN, SWAP_SWAP_LEN,
};
pub use staging::{
    cstr_slice, cstr_str, generate_server_path, validate_server_path, StagingError, STAGED_PREFIX,
};
