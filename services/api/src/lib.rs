//! Parley API Library Crate
//!
//! This library contains the web service around the conversation core: the
//! application state, the Postgres chat store, the REST handlers, the route guard,
//! the WebSocket action protocol, and routing. The binaries are thin wrappers around
//! this library.

pub mod auth;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod route_guard;
pub mod router;
pub mod state;
pub mod ws;
