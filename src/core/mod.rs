// src/core/mod.rs — Chat core: pricing, credentials, orchestration

pub mod chat;
pub mod credentials;
pub mod pricing;
pub mod tokens;
