//! Ateneo keeps a mirror of one academic portal's per-subject records.
//!
//! The portal only speaks browser: a two-step HTML form login, session
//! cookies pinned to a backend node, and record pages served as markup
//! or ad-hoc JSON. This crate logs in like a browser, extracts the
//! records, stores them idempotently in Postgres, and serves reads
//! through a snapshot cache kept consistent by deferred invalidation.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod portal;
pub mod util;
