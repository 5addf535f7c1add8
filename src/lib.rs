//! Delivery of captured job applications from a capture context to an
//! application backend, with a tab relay fallback and a local resume cache.

pub mod agent;
pub mod backend;
pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod ingress;
pub mod models;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod store;
pub mod tabs;
pub mod webdriver;
