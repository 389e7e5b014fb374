//! Drivewatch Server - Google Drive activity notifications for chat users.
//!
//! This crate provides:
//! - Per-user Drive watch channels, registered on demand and renewed before
//!   they expire
//! - Processing of Drive push notifications into comment, reply and share
//!   notifications delivered as direct messages
//! - The Google account connect flow and a broker that lets a request wait
//!   for its completion
//!
//! # Architecture
//!
//! A chat command or the renewal timer drives the [`watch::WatchManager`],
//! which talks to Drive through [`drive::DriveApi`] and persists channel
//! records in a [`store::KvStore`]. Independently, each inbound webhook call
//! runs the [`changes::ChangeProcessor`], which hands activity to the
//! [`activity::ActivityRouter`] for composition and delivery.

pub mod activity;
pub mod broker;
pub mod changes;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod drive;
pub mod error;
pub mod notify;
pub mod oauth;
pub mod renewal;
pub mod routes;
pub mod store;
pub mod types;
pub mod watch;

#[cfg(test)]
mod test_support;
