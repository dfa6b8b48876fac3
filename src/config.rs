//! Stack configuration trait.

use crate::{link::filter::AddressFilter, link::queue::PacketQueue, radio::Radio, time::Timer};
use rand_core::RngCore;

// TODO: Use associated type defaults in the trait once stable

/// Trait for stack configurations.
///
/// This trait defines a number of types to be used throughout the layers of the BLE stack, which
/// define capabilities, data structures, data, and hardware interface types to be used.
///
/// Every application must define a type implementing this trait and supply it to the stack.
pub trait Config {
    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// The BLE radio, including the scan/connection register-level command surface.
    type Radio: Radio;

    /// The packet queue to use for exchanging data between the real-time Link-Layer and
    /// non-realtime parts of the stack.
    type PacketQueue: PacketQueue;

    /// Source of randomness used to generate data-channel access addresses and `CONNECT_IND`
    /// timing fields.
    type Rng: RngCore;

    /// Address filter applied to advertisers seen while scanning.
    type Filter: AddressFilter;

    /// Local sleep clock accuracy, in parts per million, advertised to the peer in `CONNECT_IND`
    /// and used as this device's contribution to window widening.
    ///
    /// Defaults to 50 ppm, a mid-range crystal; override for hardware with a better (or worse)
    /// known oscillator.
    const LOCAL_SCA_PPM: u32 = 50;
}

// Helper aliases to make accessing producer/consumer more convenient
pub(crate) type ConfProducer<C> = <<C as Config>::PacketQueue as PacketQueue>::Producer;
pub(crate) type ConfConsumer<C> = <<C as Config>::PacketQueue as PacketQueue>::Consumer;
