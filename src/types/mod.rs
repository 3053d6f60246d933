//! Data types shared by the client and its collaborators.
//!
//! - [`dag`] - Call request and scheduler acknowledgement wire types
//! - [`lattice`] - Conflict-resolution wrappers returned by the KVS

pub mod dag;
pub mod lattice;

pub use dag::{ArgumentValue, Arguments, CallErrorCode, DagCall, GenericResponse, SerializerKind};
pub use lattice::{Lattice, LwwLattice, SetLattice};
