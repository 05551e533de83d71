//! # trigger-dump
//!
//! Trigger-driven block extractor for shared-memory data streams. The tool
//! sits between an upstream producer filling a circular block ring and a
//! downstream consumer persisting selected blocks: it drains the input ring
//! at line rate, and when a UDP trigger names a sequence position, copies
//! the one or two blocks covering that position to the output ring.
//!
//! ## Crate structure
//!
//! - **`app`**: `Observation` wires the header handshake, control
//!   listener, and drain loop for one pass over a stream.
//! - **`config`**: `Settings` loaded from TOML plus defaults, validated at
//!   startup.
//! - **`control`**: the UDP control listener and command grammar.
//! - **`drain`**: the drain loop and trigger-matching state machine.
//! - **`state`**: `DumpState`, the lock-free coordination surface between
//!   listener and drain loop.
//! - **`transport`**: the `BlockSource`/`BlockSink` seams, the
//!   memory-mapped shared-memory ring, and in-memory mocks.
//! - **`error`**: the `TriggerError` taxonomy.
//! - **`affinity`**: optional CPU core pinning.

pub mod affinity;
pub mod app;
pub mod config;
pub mod control;
pub mod drain;
pub mod error;
pub mod state;
pub mod transport;
