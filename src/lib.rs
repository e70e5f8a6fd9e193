
#![no_std]

#[cfg(test)]
extern crate std;

pub mod asn;
pub mod association;
pub mod beacon;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod deferred;
pub mod error;
pub mod lock;
pub mod mac;
pub mod neighbor;
pub mod packet;
pub mod radio;
pub mod ring;
pub mod schedule;
pub mod slot;
pub mod timer;

pub use crate::config::Config;
pub use crate::error::{CoreError, TxOutcome};
pub use crate::mac::Mac;
pub use crate::radio::Radio;
pub use crate::timer::Timer;

pub use ieee802154::mac::{Address, AddressMode, ExtendedAddress, PanId, ShortAddress};
