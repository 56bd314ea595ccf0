//! # docsync core
//!
//! Runtime-free logic shared by the docsync pipeline: the document model,
//! per-extension transform rule resolution, the [`SearchIndex`](store::SearchIndex)
//! storage trait, and index reconciliation against a source listing.
//!
//! This crate contains no tokio, sqlx, filesystem or HTTP dependencies.
//! Everything that talks to the outside world lives in the `docsync`
//! application crate and reaches this one through traits.

pub mod models;
pub mod reconcile;
pub mod rules;
pub mod store;
