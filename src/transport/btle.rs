//! # Bluetooth LE Transport
//!
//! [`DeviceClient`] backed by `btleplug`. Each client owns one adapter
//! handle; the peripheral is looked up by MAC address on connect, scanning
//! for it when the adapter has not seen it yet.
//!
//! ## Wire Format
//!
//! Jobs are sent as an ESC/POS raster stream:
//!
//! | Bytes | Meaning |
//! |-------|---------|
//! | `ESC @` | Initialize |
//! | `ESC 7 n1 n2 n3` | Heating dots, time (energy), interval |
//! | `GS v 0 m xL xH yL yH d...` | Raster image, packed rows |
//! | `ESC d n` | Feed n lines |
//!
//! The stream is written without response in MTU-sized chunks.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ClientFactory, DeviceClient, PrintOptions, ScanResult, TransportError};
use crate::bitmap::Bitmap;

/// Write characteristic used by most BLE thermal printers.
const PRINT_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_ae01_0000_1000_8000_0080_5f9b_34fb);

/// Conservative chunk size (185 MTU - 3 byte ATT header).
const CHUNK_SIZE: usize = 182;

/// Delay between write chunks so the printer buffer keeps up.
const CHUNK_WRITE_DELAY: Duration = Duration::from_millis(20);

/// How often the adapter is polled while looking for a device.
const DISCOVERY_POLL: Duration = Duration::from_millis(500);

fn ble_err(e: btleplug::Error) -> TransportError {
    TransportError::new(e.to_string())
}

/// Allocates [`BtleClient`]s on the first available adapter.
pub struct BtleFactory {
    discovery_timeout: Duration,
}

impl BtleFactory {
    pub fn new(discovery_timeout: Duration) -> Self {
        Self { discovery_timeout }
    }
}

#[async_trait]
impl ClientFactory for BtleFactory {
    async fn new_client(&self) -> Result<Box<dyn DeviceClient>, TransportError> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("no bluetooth adapter found"))?;

        debug!("Bluetooth adapter allocated");
        Ok(Box::new(BtleClient {
            adapter,
            peripheral: None,
            write_char: None,
            discovery_timeout: self.discovery_timeout,
        }))
    }
}

pub struct BtleClient {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    discovery_timeout: Duration,
}

impl BtleClient {
    async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn discover(&self, address: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.find(address).await? {
            return Ok(peripheral);
        }

        debug!(address, "Device not cached, scanning");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;

        let found = tokio::time::timeout(self.discovery_timeout, async {
            loop {
                if let Some(peripheral) = self.find(address).await? {
                    return Ok(peripheral);
                }
                tokio::time::sleep(DISCOVERY_POLL).await;
            }
        })
        .await;

        // Scanning interferes with connecting on some stacks
        let _ = self.adapter.stop_scan().await;

        match found {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(format!("device not found: {}", address))),
        }
    }
}

#[async_trait]
impl DeviceClient for BtleClient {
    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        if let Some(peripheral) = &self.peripheral {
            if peripheral.is_connected().await.map_err(ble_err)? {
                return Err(TransportError::new("already connected"));
            }
        }

        let peripheral = self.discover(address).await?;
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == PRINT_CHARACTERISTIC)
            .or_else(|| {
                characteristics
                    .iter()
                    .find(|c| c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE))
            })
            .cloned()
            .ok_or_else(|| TransportError::new("no writable characteristic found"))?;

        info!(address, characteristic = %write_char.uuid, "Connected to printer");
        self.write_char = Some(write_char);
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.write_char = None;
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(ble_err)?;
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        self.disconnect().await?;
        self.adapter.stop_scan().await.map_err(ble_err)
    }

    async fn print(&mut self, bitmap: &Bitmap, options: &PrintOptions) -> Result<(), TransportError> {
        let (Some(peripheral), Some(write_char)) = (&self.peripheral, &self.write_char) else {
            return Err(TransportError::new("not connected"));
        };

        let data = encode_job(bitmap, options)?;
        let chunks = data.chunks(CHUNK_SIZE).count();
        debug!(bytes = data.len(), chunks, "Writing print job");

        for chunk in data.chunks(CHUNK_SIZE) {
            peripheral
                .write(write_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(ble_err)?;
            tokio::time::sleep(CHUNK_WRITE_DELAY).await;
        }
        Ok(())
    }

    async fn scan(&mut self, name_filter: &str) -> Result<ScanResult, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_err)?;
        // The manager bounds the whole call; give discovery a moment first.
        tokio::time::sleep(self.discovery_timeout / 2).await;

        let mut found = ScanResult::new();
        for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
            let name = peripheral
                .properties()
                .await
                .map_err(ble_err)?
                .and_then(|p| p.local_name)
                .unwrap_or_default();
            if name.contains(name_filter) {
                found.insert(peripheral.address().to_string(), name);
            }
        }

        let _ = self.adapter.stop_scan().await;
        Ok(found)
    }
}

/// Rows per `GS v 0` raster command.
const MAX_BAND_ROWS: usize = 256;

/// Build the raster byte stream for one job.
///
/// Tall images go out as consecutive bands of at most [`MAX_BAND_ROWS`]
/// rows, each with its own raster header.
fn encode_job(bitmap: &Bitmap, options: &PrintOptions) -> Result<Vec<u8>, TransportError> {
    let rotated;
    let bitmap = if options.auto_rotate && bitmap.width() > bitmap.height() {
        rotated = bitmap.rotated();
        &rotated
    } else {
        bitmap
    };

    let width_bytes = bitmap.width_bytes();
    if width_bytes == 0 || bitmap.height() == 0 {
        return Err(TransportError::new("empty bitmap"));
    }
    let x = u16::try_from(width_bytes).map_err(|_| {
        TransportError::new(format!("bitmap too wide: {} bytes per row", width_bytes))
    })?;

    let bands = bitmap.height().div_ceil(MAX_BAND_ROWS);
    let mut data = Vec::with_capacity(bitmap.data().len() + 8 * bands + 10);
    data.extend([0x1B, 0x40]);
    data.extend([0x1B, 0x37, 0x07, options.energy, 0x02]);
    for band in bitmap.data().chunks(width_bytes * MAX_BAND_ROWS) {
        // A band holds at most MAX_BAND_ROWS rows, so the height fits.
        let rows = (band.len() / width_bytes) as u16;
        data.extend([0x1D, 0x76, 0x30, 0x00]);
        data.extend(x.to_le_bytes());
        data.extend(rows.to_le_bytes());
        data.extend_from_slice(band);
    }
    data.extend([0x1B, 0x64, options.feed_lines]);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_job_layout() {
        let bitmap = Bitmap::from_fn(16, 2, |x, _| x == 0);
        let options = PrintOptions {
            auto_rotate: false,
            feed_lines: 3,
            energy: 0x40,
        };

        let data = encode_job(&bitmap, &options).unwrap();
        assert_eq!(&data[..2], &[0x1B, 0x40]);
        assert_eq!(&data[2..7], &[0x1B, 0x37, 0x07, 0x40, 0x02]);
        assert_eq!(&data[7..15], &[0x1D, 0x76, 0x30, 0x00, 2, 0, 2, 0]);
        assert_eq!(&data[15..19], &[0x80, 0x00, 0x80, 0x00]);
        assert_eq!(&data[19..], &[0x1B, 0x64, 3]);
    }

    #[test]
    fn test_encode_job_auto_rotates_landscape() {
        let bitmap = Bitmap::from_fn(16, 8, |_, _| true);
        let options = PrintOptions {
            auto_rotate: true,
            ..Default::default()
        };

        let data = encode_job(&bitmap, &options).unwrap();
        // 8 wide, 16 tall after rotation
        assert_eq!(&data[11..15], &[1, 0, 16, 0]);
    }

    #[test]
    fn test_encode_job_splits_tall_images_into_bands() {
        let bitmap = Bitmap::from_fn(16, 300, |_, y| y % 2 == 0);
        let options = PrintOptions {
            auto_rotate: false,
            ..Default::default()
        };

        let data = encode_job(&bitmap, &options).unwrap();
        let first = 7;
        assert_eq!(&data[first..first + 8], &[0x1D, 0x76, 0x30, 0x00, 2, 0, 0, 1]);
        let second = first + 8 + 2 * 256;
        assert_eq!(&data[second..second + 8], &[0x1D, 0x76, 0x30, 0x00, 2, 0, 44, 0]);
        assert_eq!(data.len(), 7 + 2 * 8 + bitmap.data().len() + 3);
    }

    #[test]
    fn test_encode_job_rejects_oversized_rows() {
        let bitmap = Bitmap::from_fn(8 * (u16::MAX as usize + 1), 1, |_, _| false);
        let options = PrintOptions {
            auto_rotate: false,
            ..Default::default()
        };
        assert!(encode_job(&bitmap, &options).is_err());
    }
}
