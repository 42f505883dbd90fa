//! Replicated weather aggregation ordered by Lamport clocks.
//!
//! Weather stations upload JSON readings; readers ask for the freshest
//! reading of a station as of their own logical time. A deployment runs
//! several replicas behind a round-robin dispatcher, all sharing one
//! in-memory store and one shared clock.
//!
//! # Architecture
//!
//! - **Dispatcher thread**: accepts client connections and hands each one to
//!   the next live replica
//! - **Replica accept thread**: writes the clock preamble and queues the
//!   connection on a bounded channel
//! - **Replica workers**: parse one request per connection, update clocks,
//!   commit or look up readings, answer and close
//! - **Store tasks**: periodic snapshots to disk and eviction of silent
//!   sources, running while at least one replica is registered
//!
//! Blocking I/O on plain threads with crossbeam channels between them; all
//! shared state sits behind `parking_lot` locks or atomics.
//!
//! # Modules
//!
//! - [`clock`]: Lamport clock
//! - [`reading`]: stored readings and freshest-visible selection
//! - [`store`]: shared station ledgers, source liveness, persistence
//! - [`replica`]: replica server and request handling
//! - [`dispatcher`]: round-robin selection and liveness probing
//! - [`wire`]: request/response framing
//! - [`client`]: station and reader client

pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod deployment;
pub mod dispatcher;
pub mod reading;
pub mod replica;
pub mod schedule;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod wire;
