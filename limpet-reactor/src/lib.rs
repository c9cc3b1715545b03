#![allow(dead_code)]

//! A cooperative, single-threaded-per-context reactor with TCP and UDP
//! service skeletons.

pub mod context;
pub mod multiplexer;
pub mod scope;
pub mod service;
pub mod socket_io;
