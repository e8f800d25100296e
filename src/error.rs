// src/error.rs

use hrwatch_lib::transport::Channel;
use thiserror::Error;

/// Errors of the BLE connection layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("Watch not found. Is it nearby and not connected to the phone app?")]
    WatchNotFound,

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("The {0} characteristic is missing. Is this a hybrid watch?")]
    MissingCharacteristic(Channel),
}
