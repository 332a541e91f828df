pub mod augment;
pub mod benc;
pub mod bootstrap;
pub mod budget;
pub mod cleanup;
pub mod config;
pub mod dht;
pub mod direct;
pub mod error;
pub mod hash;
pub mod hints;
pub mod krpc;
pub mod network;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod request;
pub mod resolver;
pub mod swarm;
pub mod verify;
pub mod web;
pub mod wire;

#[cfg(test)]
mod testing;
