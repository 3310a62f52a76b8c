//! Peer runtime for Accord.
//!
//! A [`PeerServer`] runs one [`BeliefPropagator`] that owns the local belief
//! and a [`MessageHandler`] that answers everything else, connected to other
//! peers through [`Connection`](accord_protocol::Connection)s.
//!
//! # Key Types
//!
//! - [`PeerServer`] -- launches and stops a peer
//! - [`BeliefPropagator`] / [`BeliefQueue`] -- the merge and broadcast loop and its bounded input
//! - [`PeerSnapshot`] -- immutable view published after each iteration
//! - [`TransactionQueue`] -- pending transactions, proposed as blocks
//! - [`LocalConnection`] -- in-process transport between peers
//! - [`PeerConfig`] -- TOML-loadable settings

pub mod config;
pub mod connections;
pub mod error;
pub mod handler;
pub mod local;
pub mod propagator;
pub mod server;
pub mod transactions;

pub use config::{PeerConfig, StoreConfig};
pub use connections::ConnectionManager;
pub use error::{PeerError, PeerResult};
pub use handler::MessageHandler;
pub use local::LocalConnection;
pub use propagator::{now_millis, BeliefPropagator, BeliefQueue, PeerSnapshot, PropagatorStats};
pub use server::PeerServer;
pub use transactions::TransactionQueue;
