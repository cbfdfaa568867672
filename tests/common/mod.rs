//! Scripted fake device shared by the integration tests.

#![allow(dead_code)]

use daqlink::device::DeviceSettings;
use daqlink::protocol::{encode_frame, DeviceMessage, DeviceTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// Far end of a duplex link. Every command line is recorded and handed to a
/// responder whose bytes are written back.
pub struct FakeDevice {
    log: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    /// Commands received so far, without terminators.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Number of commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Drop the link as if the cable was pulled.
    pub fn unplug(self) {
        self.task.abort();
    }
}

/// Spawn a fake device answering with `respond`.
pub fn fake_device<F>(mut respond: F) -> (DeviceTransport, FakeDevice)
where
    F: FnMut(&str) -> Vec<u8> + Send + 'static,
{
    let (host, far) = tokio::io::duplex(64 * 1024);
    let (read, mut write) = tokio::io::split(far);
    let log = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = line.trim_end().to_string();
            seen.lock().push(command.clone());
            let reply = respond(&command);
            if !reply.is_empty() && write.write_all(&reply).await.is_err() {
                break;
            }
        }
    });

    (DeviceTransport::from_stream(host), FakeDevice { log, task })
}

/// Fast timings so tests do not wait on real settle delays.
pub fn fast_settings() -> DeviceSettings {
    DeviceSettings {
        frequency_hz: 100,
        settle_delay: Duration::from_millis(2),
        status_retry: Duration::from_millis(250),
        text_idle: Duration::from_millis(30),
        channel_capacity: 256,
    }
}

/// Status reply describing a small board.
pub fn status_reply(analog: u32, digital: u32) -> DeviceMessage {
    DeviceMessage {
        analog_in_port_num: analog,
        digital_port_num: digital,
        analog_in_res: 1000,
        analog_in_port_range: vec![10.0; analog as usize],
        device_sn: 0x7E28_1591_6200_E898,
        device_pn: "Nq1".to_string(),
        device_fw_rev: "2.0.1".to_string(),
        ..Default::default()
    }
}

/// Streaming message as the firmware sends it.
pub fn stream_message(tick: u32, analog: Vec<i32>, digital: [u8; 2]) -> DeviceMessage {
    DeviceMessage {
        msg_time_stamp: tick,
        analog_in_data: analog,
        digital_data: digital.to_vec(),
        device_status: 1,
        bat_status: 2,
        ..Default::default()
    }
}

/// Frames concatenated as they would appear on the wire or in a log.
pub fn frames(messages: &[DeviceMessage]) -> Vec<u8> {
    messages.iter().flat_map(encode_frame).collect()
}
