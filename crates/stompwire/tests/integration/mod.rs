//! Shared helpers for stompwire integration tests
//!
//! A [`TestClient`] talks to a real `StompConnection` over an in-memory
//! duplex stream, with the server side driven by `stompwire::drive`.

#![allow(dead_code)]

pub mod client;

pub use client::*;
