//! Bluetooth Module
//!
//! Classic Bluetooth (RFCOMM) link to the turret.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkManager                         │
//! │   (state machine - driven through a LinkHandle)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────────┐
//! │  Scanner  │  │ Connection │  │ StreamChannel │
//! │           │  │            │  │               │
//! │ - device  │  │ - ordered  │  │ - read loop   │
//! │  discovery│  │  strategies│  │ - writes      │
//! └───────────┘  └────────────┘  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire format and service constants
//! - [`scanner`] - Device discovery through `bluetoothctl`
//! - [`connection`] - Connection strategies and connect-with-fallback
//! - [`channel`] - Open connection streams
//! - [`service`] - Link state machine
//! - [`error`] - Link errors

pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod service;

pub use service::{LinkHandle, LinkManager};
