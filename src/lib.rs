//! chatflow - declarative conversation flow engine
//!
//! Compiles a versioned flow document into a state machine and runs
//! sessions against it: guarded transitions, entry actions with retry,
//! dynamic option lists and field validation.

pub mod action;
pub mod api;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod expression;
pub mod flow;
pub mod http;
pub mod machine;
pub mod options;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod validation;
