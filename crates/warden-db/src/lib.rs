//! Database layer for the Warden gateway.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and query helpers. Every database table in
//! Warden is created through versioned migrations managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the gateway's durable state (tenant
//!   registrations, module bindings, mitigation records, audit log) is
//!   low-write and read-heavy; WAL mode allows concurrent readers with a
//!   single writer, which matches that access pattern. Hot-path counters
//!   never touch this database — they live in the counter store.
//! - **`r2d2` connection pool**: provides bounded connection reuse without
//!   manual lifetime management.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, ensuring migrations ship with the gateway and cannot
//!   drift from the code that depends on them.

mod migrations;
mod pool;

pub use migrations::run_migrations;
pub use pool::{create_pool, DbPool, DbRuntimeSettings};
