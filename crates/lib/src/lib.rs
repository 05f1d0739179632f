//! gridadmin-lib: the descriptor-tree engine behind gridadmin
//!
//! This crate keeps a client-side mirror of a deployment registry:
//! - `descriptor`: applications, nodes, servers, services and templates
//! - `resolver`: `${name}` lookup through application, node, server and
//!   instance scopes
//! - `tree`: the arena tree the mirror is drawn in, with transactional
//!   restore
//! - `mirror`: building the tree from descriptors, local edits, template
//!   fan-out and registry events
//! - `sync`: serial ordering, the write lease and the session driver
//! - `registry`: the registry contract and a directory-backed registry

pub mod config;
pub mod descriptor;
pub mod mirror;
pub mod registry;
pub mod resolver;
pub mod substitution;
pub mod sync;
pub mod tree;
