//! Lagoon identity core — nick/client synchronization across a server mesh.
//!
//! Leaves first: [`casemap`] and [`validate`] are pure helpers, [`registry`]
//! owns every live [`identity::Identity`], [`collision`] decides nick battles,
//! [`propagation`] fans verdicts out to peer links. [`local`] and [`remote`]
//! are the two entry points that drive all of it from [`server::ServerState`].
pub mod casemap;
pub mod codec;
pub mod collision;
pub mod config;
pub mod connection;
pub mod identity;
pub mod link;
pub mod local;
pub mod message;
pub mod metrics;
pub mod nick_delay;
pub mod propagation;
pub mod registry;
pub mod remote;
pub mod server;
pub mod validate;
