//! Simulated HID++ 2.0 device answering the requests the stack issues

use crate::features::feature_id;

#[derive(Debug, Clone)]
pub(crate) struct SimulatedDevice {
    pub index: u8,
    pub name: &'static str,
    pub device_type: u8,
    pub unit_id: [u8; 4],
    /// Feature ids at indices 1..
    pub features: Vec<u16>,
    /// Battery status params (percent, flags, status)
    pub battery: [u8; 3],
}

impl SimulatedDevice {
    /// A mouse at `index` with the Unified Battery feature
    pub fn mouse(index: u8) -> Self {
        Self {
            index,
            name: "MX Master 3",
            device_type: 3,
            unit_id: [0x4A, 0x1B, 0x2C, 0x3D],
            features: vec![
                feature_id::FEATURE_SET,
                feature_id::DEVICE_INFORMATION,
                feature_id::DEVICE_NAME,
                feature_id::UNIFIED_BATTERY,
            ],
            battery: [75, 0x04, 0x00],
        }
    }

    pub fn feature_index(&self, id: u16) -> u8 {
        self.features
            .iter()
            .position(|&f| f == id)
            .map(|p| p as u8 + 1)
            .unwrap_or(0)
    }

    pub fn respond(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let reply = |params: &[u8]| {
            let mut frame = vec![0x11, request[1], request[2], request[3]];
            frame.extend_from_slice(params);
            frame.resize(20, 0);
            vec![frame]
        };

        if request[1] != self.index {
            // Receivers reject requests for empty slots with a 1.0 error
            return vec![vec![0x10, request[1], 0x8F, request[2], request[3], 0x08, 0x00]];
        }

        let function = request[3] >> 4;
        if request[2] == 0x00 {
            return match function {
                0x0 => reply(&[self.feature_index(u16::from_be_bytes([request[4], request[5]]))]),
                0x1 => reply(&[4, 2, request[6]]),
                _ => Vec::new(),
            };
        }

        let Some(&feature) = self.features.get(request[2] as usize - 1) else {
            return Vec::new();
        };
        match (feature, function) {
            (feature_id::FEATURE_SET, 0x0) => reply(&[self.features.len() as u8]),
            (feature_id::FEATURE_SET, 0x1) => {
                match (request[4] as usize)
                    .checked_sub(1)
                    .and_then(|i| self.features.get(i))
                {
                    Some(id) => reply(&id.to_be_bytes()),
                    None => Vec::new(),
                }
            }
            (feature_id::DEVICE_INFORMATION, 0x0) => {
                let mut params = vec![1];
                params.extend_from_slice(&self.unit_id);
                reply(&params)
            }
            (feature_id::DEVICE_NAME, 0x0) => reply(&[self.name.len() as u8]),
            (feature_id::DEVICE_NAME, 0x1) => {
                let offset = (request[4] as usize).min(self.name.len());
                let end = (offset + 16).min(self.name.len());
                reply(&self.name.as_bytes()[offset..end])
            }
            (feature_id::DEVICE_NAME, 0x2) => reply(&[self.device_type]),
            (feature_id::BATTERY_UNIFIED_LEVEL, 0x0)
            | (feature_id::UNIFIED_BATTERY, 0x1)
            | (feature_id::BATTERY_VOLTAGE, 0x0) => reply(&self.battery),
            _ => Vec::new(),
        }
    }
}
