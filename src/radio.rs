//! Radio hardware abstraction for the Central/Master Link Layer.
//!
//! The Peripheral-role Link Layer only ever needs to arm the radio for a single TX-then-listen
//! pair per advertising/connection event, which the teacher crate modeled with the narrow
//! `link::Transmitter` trait (buffer access only). A Central additionally has to actively scan,
//! decide per-event whether it transmits or listens first, and reprogram the access address,
//! CRC seed and whitening seed on every hop, so this crate exposes the fuller register-level
//! command set here instead of growing `Transmitter` into something it isn't.
//!
//! Implementations are expected to be thin wrappers around a concrete radio peripheral (eg. a
//! nRF52 `RADIO` or a Semtech SX128x in BLE mode); none of the methods here block longer than it
//! takes to issue the corresponding hardware command.

use crate::time::Duration;

/// The operating mode the radio should be placed into before a command is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    /// Radio is off / idle.
    Standby,
    /// Radio will transmit the buffer handed to `submit_tx`.
    Tx,
    /// Radio will listen for an incoming packet, aborting after `timeout` if nothing arrives.
    RxWithTimeout(Duration),
}

/// Outcome of polling the radio for an IRQ since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    /// Nothing has happened yet.
    None,
    /// A packet was transmitted successfully.
    TxDone,
    /// A packet was received; its length in bytes is given (header + payload, CRC stripped).
    RxDone(u8),
    /// The configured RX timeout elapsed without receiving anything.
    RxTimeout,
    /// The received packet failed the CRC check.
    CrcError,
}

/// Register-level control surface a concrete radio peripheral exposes to the Link Layer.
///
/// All setters program hardware registers and take effect the next time `set_mode` arms the
/// radio; they do not interrupt an in-flight TX/RX. The Link Layer reprograms every field listed
/// here at the top of each connection event (see `link::connection::Connection::hop_channel`) —
/// nothing here is assumed to stay valid across a mode change.
pub trait Radio {
    /// Tunes the radio to `freq_hz`, the channel's center frequency.
    fn set_freq_hz(&mut self, freq_hz: u32);

    /// Programs the 32-bit access address to match against on receive, and to prefix transmitted
    /// packets with.
    fn set_sync_word_32(&mut self, access_address: u32);

    /// Programs the 7-bit data-whitening LFSR seed for the current channel.
    fn set_whitening_seed(&mut self, seed: u8);

    /// Programs the 24-bit CRC seed (`CRCInit` on data channels, the fixed advertising seed
    /// otherwise).
    fn set_crc_init_24(&mut self, crc_init: u32);

    /// Places the radio into `mode`, arming it for the next TX or RX.
    fn set_mode(&mut self, mode: RadioMode);

    /// Hands the radio a packet to transmit. Must be called while in `RadioMode::Tx`.
    ///
    /// Returns `false` if `buf` doesn't fit in the radio's TX buffer.
    fn submit_tx(&mut self, buf: &[u8]) -> bool;

    /// Polls for a hardware IRQ since the last call, without blocking.
    fn poll_irq(&mut self) -> RadioEvent;

    /// Copies the most recently received packet (header + payload, no CRC) into `buf`, returning
    /// the number of bytes written.
    fn read_rx(&mut self, buf: &mut [u8]) -> u8;

    /// Returns the RSSI, in dBm, sampled during reception of the most recently received packet.
    fn rssi_dbm(&self) -> i8;

    /// Returns the radio to a known-idle state, aborting any in-flight TX/RX.
    fn reset(&mut self);
}
