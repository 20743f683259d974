//! # sqlbatch-server
//!
//! Worker process for the SQL batch service: loads configuration, wires the
//! Redis and PostgreSQL backends into [`sqlbatch_core::batch::Batch`] and
//! exposes a few operator subcommands.

pub mod infra;
