//! `btleplug` backend for the watch transport
//!
//! Discovery and connection live here; the protocol core only sees the
//! [`Transport`] implementation. A background task forwards GATT
//! notifications from the peripheral into a [`NotificationHub`].

use crate::error::Error;
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_lite::StreamExt;
use hrwatch_lib::error::TransportError;
use hrwatch_lib::transport::{Channel, Notification, NotificationHub, NotificationStream, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::{Uuid, uuid};

/// Primary service advertised by hybrid watches
pub const WATCH_SERVICE_UUID: Uuid = uuid!("3dda0001-957f-7d4a-34a6-74696673696d");

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub is_watch: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, Error> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Scan for BLE devices for `duration`
pub async fn scan(duration: Duration) -> Result<Vec<ScannedDevice>, Error> {
    let adapter = get_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            devices.push(ScannedDevice {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_watch: props.services.contains(&WATCH_SERVICE_UUID),
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

/// Find a watch by name/address pattern, or the first device advertising the watch service
pub async fn find_watch(target: Option<&str>, duration: Duration) -> Result<Peripheral, Error> {
    let adapter = get_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    for peripheral in adapter.peripherals().await? {
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        let name = props.local_name.unwrap_or_default();
        let address = peripheral.address().to_string();
        let matches = match target {
            Some(t) => name.contains(t) || address.eq_ignore_ascii_case(t),
            None => props.services.contains(&WATCH_SERVICE_UUID),
        };
        if matches {
            info!("Found watch {} ({})", name, address);
            adapter.stop_scan().await?;
            return Ok(peripheral);
        }
    }

    adapter.stop_scan().await?;
    Err(Error::WatchNotFound)
}

/// Connected watch exposing the three protocol characteristics
pub struct BleTransport {
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    hub: Arc<NotificationHub>,
    pump: JoinHandle<()>,
}

impl BleTransport {
    pub async fn connect(peripheral: Peripheral) -> Result<Self, Error> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics: HashMap<Channel, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter_map(|c| Channel::from_uuid(&c.uuid).map(|channel| (channel, c)))
            .collect();
        for channel in [Channel::Operations, Channel::Data, Channel::Authentication] {
            if !characteristics.contains_key(&channel) {
                return Err(Error::MissingCharacteristic(channel));
            }
        }

        let hub = Arc::new(NotificationHub::new());
        let mut notifications = peripheral.notifications().await?;
        let pump_hub = hub.clone();
        let pump = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                match Channel::from_uuid(&n.uuid) {
                    Some(channel) => pump_hub.publish(Notification::new(channel, n.value)),
                    None => trace!("Notification from unrelated characteristic {}", n.uuid),
                }
            }
            debug!("Notification stream ended");
            pump_hub.close();
        });

        info!("Connected to {}", peripheral.address());
        Ok(Self {
            peripheral,
            characteristics,
            hub,
            pump,
        })
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.hub.close();
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn characteristic(&self, channel: Channel) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&channel)
            .ok_or(TransportError::ChannelUnavailable(channel))
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, channel: Channel, data: &[u8], require_ack: bool) -> Result<(), TransportError> {
        let characteristic = self.characteristic(channel)?;
        let write_type = if require_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<NotificationStream, TransportError> {
        // Register first so nothing is dropped between enabling notifications and returning.
        let fresh: Vec<Channel> = channels
            .iter()
            .copied()
            .filter(|c| !self.hub.is_subscribed(*c))
            .collect();
        let rx = self.hub.subscribe(channels);
        for channel in fresh {
            let characteristic = self.characteristic(channel)?;
            self.peripheral
                .subscribe(characteristic)
                .await
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            debug!("Notifications enabled on {}", channel);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, stream: NotificationStream) -> Result<(), TransportError> {
        // Notifications stay enabled while another subscriber still listens.
        for channel in self.hub.unsubscribe(stream.id()) {
            if self.hub.is_subscribed(channel) {
                continue;
            }
            let characteristic = self.characteristic(channel)?;
            if let Err(e) = self.peripheral.unsubscribe(characteristic).await {
                warn!("Failed to disable notifications on {}: {}", channel, e);
            }
        }
        Ok(())
    }
}
