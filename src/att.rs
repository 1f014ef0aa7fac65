//! Attribute-level types shared by the local (server) and remote (client)
//! models ([Vol 3] Part F).

pub use {consts::*, handle::*, perm::*, value::*};

mod consts;
mod handle;
mod perm;
mod value;
