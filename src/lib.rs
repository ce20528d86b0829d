//! pipbox: a process sandbox core for build tasks
//! Mediates file-system accesses of a build task ("pip") and its whole
//! process tree: policy evaluation against a File Access Manifest,
//! fixed-size access reports streamed over shared lock-free queues, and
//! process-tree tracking until the last descendant exits.

pub mod cli;
pub mod dispatch;
pub mod fam;
pub mod observability;
pub mod pip;
pub mod policy;
pub mod queue;
pub mod sandbox;
pub mod tracker;
pub mod trie;
pub mod types;
