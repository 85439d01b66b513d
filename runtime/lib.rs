// Copyright 2024 the wjs authors. MIT license.

//! A concurrent worker / message-passing runtime built on `deno_core`: a
//! single-threaded script engine per worker, connected by typed mailboxes,
//! with a distributed quiescence detector standing in for full-program
//! join semantics (spec §1).

mod bindings;
mod context;
mod error;
mod message;
mod port;
mod quiescence;
mod run_loop;
mod worker;

pub use error::WorkerError;
pub use worker::run_root;
