#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod addresses;
pub mod batch;
pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod domain_xml;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod operation;
pub mod paths;
pub mod progress;
pub mod render;
pub mod selector;
pub mod snapshot;
