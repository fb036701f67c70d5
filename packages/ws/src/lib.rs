//! WebSocket message handling for `DiceBox`.
//!
//! This crate owns the wire protocol between clients and a session
//! coordinator: parsing and validating inbound messages, persisting roll
//! records through `dicebox_session`, and building the outbound broadcasts.
//! It is transport-agnostic; the coordinator supplies a [`WebsocketSender`]
//! and routes raw frames through [`process_message`].
//!
//! # Main Components
//!
//! * [`WebsocketSender`] - Trait for sending messages to WebSocket connections
//! * [`WebsocketContext`] - Context information for a WebSocket connection
//! * [`process_message`] - Processes incoming WebSocket messages
//! * [`connect`] and [`disconnect`] - Handle connection lifecycle
//! * [`models`] - Message payload types for inbound and outbound communication

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod ws;

pub use ws::*;

pub mod models;
