//! Gateway: the fan-out engine and its HTTP/WebSocket surface.
//!
//! Lifecycle:
//! 1. Load + validate config, connect the broker backend
//! 2. Build the manager (room, publisher, subscriber, offline queue,
//!    limiter) and start its control-drain, heartbeat, and subscriber tasks
//! 3. Serve the ingress API and the `/ws` upgrade endpoint
//! 4. On shutdown, stop the heartbeat, then the subscriber, then the
//!    publisher, then close a snapshot of the connections
//!
//! A published event is delivered locally through the room (or queued
//! offline when the user has no session here), and also emitted on the
//! fabric so peer nodes can deliver to their own sessions. Peer copies of
//! our own publishes are dropped by the subscriber's self-origin filter.

pub mod auth;
pub mod connection;
pub mod heartbeat;
pub mod limiter;
pub mod manager;
pub mod publisher;
pub mod ratelimit;
pub mod room;
pub mod routes;
pub mod server;
pub mod subscriber;
