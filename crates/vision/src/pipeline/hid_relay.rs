//! USB HID relay boards (the common `16c0:05df` "USBRelayN" family).
//!
//! A channel is switched with a 9-byte feature report:
//! `[0x00, 0xFF | 0xFD, channel, 0, 0, 0, 0, 0, 0]` (ON | OFF).

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use hidapi::{HidApi, HidDevice};

use crate::pipeline::relay::{RelayBoard, RelayBoardOpener, RelayError};

const VENDOR_ID: u16 = 0x16c0;
const PRODUCT_ID: u16 = 0x05df;
const CMD_ON: u8 = 0xFF;
const CMD_OFF: u8 = 0xFD;

/// Opens the first attached HID relay board.
#[derive(Default)]
pub struct HidRelayOpener {
    api: Mutex<Option<HidApi>>,
}

impl HidRelayOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelayBoardOpener for HidRelayOpener {
    fn open(&self) -> Result<Box<dyn RelayBoard>, RelayError> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        match api.as_mut() {
            Some(api) => api
                .refresh_devices()
                .context("failed to enumerate HID devices")?,
            None => *api = Some(HidApi::new().context("failed to initialise hidapi")?),
        }
        let Some(api) = api.as_ref() else {
            return Err(RelayError::BoardNotFound);
        };

        let present = api
            .device_list()
            .any(|info| info.vendor_id() == VENDOR_ID && info.product_id() == PRODUCT_ID);
        if !present {
            return Err(RelayError::BoardNotFound);
        }
        let device = api
            .open(VENDOR_ID, PRODUCT_ID)
            .context("failed to open HID relay board")?;
        Ok(Box::new(HidRelayBoard { device }))
    }
}

struct HidRelayBoard {
    device: HidDevice,
}

impl RelayBoard for HidRelayBoard {
    fn set_state(&mut self, channel: u8, on: bool) -> anyhow::Result<()> {
        let command = if on { CMD_ON } else { CMD_OFF };
        let report = [0x00, command, channel, 0, 0, 0, 0, 0, 0];
        self.device
            .send_feature_report(&report)
            .with_context(|| format!("feature report for channel {channel}"))?;
        Ok(())
    }
}
