//! Deployment descriptors.
//!
//! Descriptors are plain value records describing what the registry deploys:
//! applications, nodes, servers, services, adapters, database environments,
//! replica groups and the templates that servers and services are stamped
//! out from. They are cloned before mutation and never shared mutably.
//!
//! [`ApplicationUpdateDescriptor`] is the incremental form exchanged with the
//! registry in both directions: pushed `applicationUpdated` events carry one,
//! and saving local edits produces one.

mod info;
mod types;
mod update;

pub use info::*;
pub use types::*;
pub use update::*;
