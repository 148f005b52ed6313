//! Develoop club site core: auth state, lazily provisioned member profiles,
//! route guarding, and club events / project-progress posts over a hosted
//! auth service and row store.

pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod model;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;
