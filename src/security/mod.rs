// src/security/mod.rs — Secret handling

pub mod cipher;

pub use cipher::KeyCipher;
