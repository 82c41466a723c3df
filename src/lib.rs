//! SD card SPI-mode protocol engine, in the manner of [sdmmc-spi](https://crates.io/crates/sdmmc-spi).
//!
//! The engine brings a card up (CMD0, CMD8, CMD55/ACMD41, CMD58, CMD16) and reads
//! single 512-byte blocks (CMD17), all behind a word-addressable host bus:
//! [`SdSpiBus`] takes word reads with a byte enable mask, maps them onto the
//! buffered block and reports access faults, an interrupt line and debug status.
//!
//! The bit channel is an [`embedded_hal::blocking::spi::Transfer`] for the
//! full-duplex byte exchange plus a [`switch_hal::OutputSwitch`] for chip select.
//! Nothing blocks: each [`SdSpiBus::tick`] performs one bounded step, and the
//! host polls [`SdSpiBus::valid`] until a queued read completes.
//!
//! [`SdSpiDisk`] exposes the same engine as a [`DiskioDevice`], one whole block at
//! a time.

#![cfg_attr(not(test), no_std)]

// MUST be the first module listed
mod fmt;

mod bus;
mod command;
mod config;
mod consts;
mod crc;
mod disk;
mod error;
mod init;
mod link;
mod response;
mod transfer;

pub use crate::{
    bus::{BusRequest, BusRequestKind, BusResponse, DebugStatus, SdSpiBus},
    command::{encode, read_single_block, CommandToken},
    config::{DataCrcPolicy, DefaultSdSpiConfig, SdSpiConfig},
    consts::{commands, tokens, wire, BLOCK_SIZE, BLOCK_WORDS},
    crc::{crc16, crc7},
    disk::SdSpiDisk,
    error::{BusFault, Error, ProtocolError},
    init::CardState,
    response::{decode, R1Response, Response, ResponseShape},
    transfer::BlockBuffer,
};
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};
