//! Command Handler Module
//!
//! This module implements the command processing layer for ledgerkv.
//! It receives decoded commands, executes them against the storage engine
//! (logging mutations to the AOF first), and returns the reply.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Decoder        │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ CommandHandler  │────>│  Aof            │  (persistence module)
//! │                 │     └─────────────────┘
//! │  - Dispatch     │
//! │  - Validate     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```

pub mod handler;

pub use handler::CommandHandler;
