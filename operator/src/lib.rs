pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod event;
pub mod handler;
pub mod informer;
pub mod key;
pub mod metrics;
pub mod queue;
pub mod reconcile;

#[cfg(test)]
mod testutil;
