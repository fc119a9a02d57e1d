// src/lib.rs — Library root for chathub

pub mod api;
pub mod auth;
pub mod cli;
pub mod core;
pub mod infra;
pub mod provider;
pub mod security;
pub mod store;
