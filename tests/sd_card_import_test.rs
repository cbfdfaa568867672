//! Downloading SD-card logs and importing them into sinks.

mod common;

use chrono::{Local, TimeZone, Utc};
use common::{fake_device, fast_settings, frames, status_reply, stream_message};
use daqlink::config::ImportConfig;
use daqlink::device::{
    AnalogCalibration, ChannelDescriptor, ChannelKind, ConnectionKind, DaqDevice, DeviceIdentity,
    DeviceMetadata, DeviceMode,
};
use daqlink::protocol::encode_frame;
use daqlink::sdcard::{DownloadResult, ImportOutcome, ImportRequest, SdCardImporter};
use daqlink::storage::{MemorySink, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LOG_NAME: &str = "log_20241105_120000.bin";

fn recorded_log() -> Vec<u8> {
    frames(&[
        stream_message(1_000, vec![100], [0, 0]),
        stream_message(50_001_000, vec![200], [0, 0]),
        stream_message(100_001_000, vec![300], [0, 0]),
    ])
}

#[tokio::test]
async fn downloaded_log_imports_into_sink() {
    let log = recorded_log();
    let served = log.clone();
    let (transport, fake) = fake_device(move |cmd| {
        if cmd == "SYSTem:SYSInfoPB?" {
            return encode_frame(&status_reply(2, 0));
        }
        if cmd.starts_with("SYSTem:STORage:SD:GET") {
            return served.clone();
        }
        Vec::new()
    });

    let mut device = DaqDevice::new(transport, ConnectionKind::Usb, fast_settings());
    device.initialize().await.unwrap();
    device.wait_until_ready(Duration::from_secs(2)).await.unwrap();
    device.switch_mode(DeviceMode::LogToDevice).await.unwrap();
    device.activate_channel(ChannelKind::Analog, 0).await.unwrap();

    let download = device
        .download_sd_card_file(LOG_NAME, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(fake
        .commands()
        .contains(&format!("SYSTem:STORage:SD:GET \"{LOG_NAME}\"")));
    let DownloadResult::Completed { content, file_name } = download else {
        panic!("download failed: {download:?}");
    };
    assert_eq!(file_name, LOG_NAME);
    assert_eq!(content, log);

    let sink = Arc::new(MemorySink::new());
    let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());
    let outcome = importer
        .import(
            ImportRequest {
                file_name: file_name.clone(),
                content,
                device: Some(device.metadata()),
            },
            &CancellationToken::new(),
            None,
        )
        .await;

    let ImportOutcome::Completed {
        session_id,
        samples_imported,
        channel_colors,
    } = outcome
    else {
        panic!("import failed: {outcome:?}");
    };
    assert_eq!(samples_imported, 3);
    assert!(channel_colors.get("AI0").is_some());

    let samples = sink.samples(session_id);
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    // Resolution 1000 over a 10 V range
    assert_eq!(values, vec![1.0, 2.0, 3.0]);

    let started = Local
        .with_ymd_and_hms(2024, 11, 5, 12, 0, 0)
        .earliest()
        .unwrap()
        .with_timezone(&Utc);
    assert_eq!(samples[0].timestamp, started);
    assert_eq!(
        samples[2].timestamp - samples[0].timestamp,
        chrono::Duration::seconds(2)
    );
    assert_eq!(sink.sessions()[0].name, LOG_NAME);
}

#[tokio::test]
async fn silent_download_fails_and_restores_streaming() {
    let (transport, fake) = fake_device(|cmd| {
        if cmd == "SYSTem:SYSInfoPB?" {
            encode_frame(&status_reply(1, 0))
        } else {
            Vec::new()
        }
    });
    let mut device = DaqDevice::new(transport, ConnectionKind::Usb, fast_settings());
    device.initialize().await.unwrap();
    device.wait_until_ready(Duration::from_secs(2)).await.unwrap();
    device.switch_mode(DeviceMode::LogToDevice).await.unwrap();

    let result = device
        .download_sd_card_file(LOG_NAME, Duration::from_millis(150))
        .await
        .unwrap();
    assert_eq!(
        result,
        DownloadResult::Failed("File content is empty".to_string())
    );
    assert_eq!(device.handler(), daqlink::device::Handler::Streaming);
    drop(fake);
}

#[tokio::test]
async fn corrupted_log_still_imports_intact_messages() {
    let mut content = vec![0x07, 0xff, 0x13];
    content.extend(recorded_log());
    let mid = content.len() / 2;
    content.splice(mid..mid, [0xde, 0xad, 0xbe, 0xef]);

    let device = DeviceMetadata {
        identity: DeviceIdentity::with_serial("7E28", ConnectionKind::Usb),
        channels: vec![ChannelDescriptor::analog(0, AnalogCalibration::default()).active()],
    };
    let sink = Arc::new(MemorySink::new());
    let importer = SdCardImporter::new(sink.clone(), ImportConfig::default());
    let outcome = importer
        .spawn(
            ImportRequest {
                file_name: "unnamed.bin".to_string(),
                content,
                device: Some(device),
            },
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    // The frame the garbage landed in is lost; the rest survive
    let ImportOutcome::Completed {
        samples_imported, ..
    } = outcome
    else {
        panic!("import failed: {outcome:?}");
    };
    assert!(samples_imported >= 2);
    let values: Vec<f64> = sink.samples(SessionId(1)).iter().map(|s| s.value).collect();
    assert!(values.contains(&100.0));
    assert!(values.contains(&300.0));
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn import_writes_csv() {
    use daqlink::storage::CsvSink;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("samples.csv");
    let sink = Arc::new(CsvSink::create(&path).unwrap());
    let importer = SdCardImporter::new(sink, ImportConfig::default());

    let device = DeviceMetadata {
        identity: DeviceIdentity::with_serial("7E28", ConnectionKind::Usb),
        channels: vec![ChannelDescriptor::analog(0, AnalogCalibration::default()).active()],
    };
    let outcome = importer
        .import(
            ImportRequest {
                file_name: LOG_NAME.to_string(),
                content: recorded_log(),
                device: Some(device),
            },
            &CancellationToken::new(),
            None,
        )
        .await;
    assert!(outcome.is_success(), "{}", outcome.message());

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "session_id,serial,channel,timestamp,value");
    assert!(lines[1].starts_with("1,7E28,AI0,"));
    assert!(lines[3].ends_with(",300.0"));
}
