//! A `no_std` BLE Central/Master host and link layer.
//!
//! Scans for, connects to, and exchanges ATT writes/notifications with a single peripheral. Tries
//! to adhere to the *Bluetooth Core Specification v4.2* (at least for now).
//!
//! # Using the stack
//!
//! This crate is runtime and hardware-agnostic: it does not need an RTOS (although you can
//! certainly use one if you want) and provides hardware interfaces that need to be implemented
//! once for every supported MCU family.
//!
//! The only part that interacts directly with platform-specific interfaces is [`link`], the BLE
//! Link-Layer implementation. You have to provide it with a few hardware-specific services:
//! * A microsecond-precision [`Timer`].
//! * A [`Radio`] exposing the register-level scan/connection command surface.
//! * A [`Config`] tying those, plus a packet queue, RNG and address filter, together.
//!
//! [`link`]: link/index.html
//! [`Timer`]: time/trait.Timer.html
//! [`Radio`]: radio/trait.Radio.html
//! [`Config`]: config/trait.Config.html

#![no_std]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod app;
pub mod att;
pub mod bytes;
pub mod config;
mod crc;
mod error;
pub mod l2cap;
pub mod link;
pub mod phy;
pub mod radio;
pub mod time;
pub mod uuid;

pub use self::error::Error;

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth specification implemented by this crate.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V4_2;
