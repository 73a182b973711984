//! Inventory - find tags around a simulated anchor.
//!
//! This example demonstrates:
//! - Starting a provider on an in-memory transport
//! - Running an inventory that stops itself after a number of tags
//! - Consuming `RtlsEvent`s
//!
//! The anchor on the far end is a small task that answers the version query
//! and every search request with a random tag.
//!
//! ```sh
//! cargo run --example inventory
//! ```

use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use rtls_provider::codec::{ErrorCode, Payload, SearchRequest, TagSearchResult, Version, VersionInfo};
use rtls_provider::protocol::{DeviceId, Frame, FrameBuffer, MessageId};
use rtls_provider::transport::{loopback, DEFAULT_LOOPBACK_CAPACITY};
use rtls_provider::{DeviceStatus, OperationParams, ProviderBuilder, RtlsEvent};

const ANCHOR: DeviceId = DeviceId::new([0xA0, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (host, device) = loopback(DEFAULT_LOOPBACK_CAPACITY);
    tokio::spawn(simulated_anchor(device));

    let (reader, writer) = tokio::io::split(host);
    let (provider, mut events) = ProviderBuilder::new()
        .power_level(24)
        .start(reader, writer)
        .await?;

    while let Some(event) = events.recv().await {
        match event {
            RtlsEvent::Version(info) => {
                println!("anchor {} running {}", provider.anchor_id(), info.application);
                provider
                    .start_operation(OperationParams::Inventory {
                        led_blink: false,
                        mask: None,
                        stop_after: 5,
                    })
                    .await?;
            }
            RtlsEvent::TagFound(tag) => {
                println!("tag {}  rssi {} dBm  {} cm", tag.tag_id, tag.rssi, tag.distance_cm);
            }
            RtlsEvent::StatusChanged {
                previous: DeviceStatus::Busy,
                current: DeviceStatus::Idle,
            } => break,
            _ => {}
        }
    }

    provider.shutdown().await?;
    Ok(())
}

async fn simulated_anchor(mut stream: DuplexStream) -> std::io::Result<()> {
    let mut buffer = FrameBuffer::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in buffer.push(&buf[..n]).into_iter().flatten() {
            let reply = match frame.message_id {
                MessageId::GetVersion => VersionInfo {
                    application: Version([1, 4, 0, 2]),
                    bootloader: Version([1, 0, 0, 0]),
                }
                .encode(),
                MessageId::TagAnchorSearch => {
                    let Ok(request) = SearchRequest::decode(frame.payload()) else {
                        continue;
                    };
                    random_tag(&request).encode()
                }
                _ => continue,
            };
            let id = match frame.message_id {
                MessageId::GetVersion => MessageId::VersionNotify,
                _ => MessageId::TagAnchorSearchNotify,
            };
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let wire = Frame::new(ANCHOR, id, reply)
                .encode()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            stream.write_all(&wire).await?;
        }
    }
}

fn random_tag(request: &SearchRequest) -> TagSearchResult {
    let mut rng = rand::thread_rng();
    let answered = rng.gen_bool(0.7);
    TagSearchResult {
        search_index: request.search_index,
        error: if answered {
            ErrorCode::NoError
        } else {
            ErrorCode::NoResponse
        },
        tag_id: DeviceId::new([0xE2, 0, 0, 0, 0, rng.gen_range(1..=8)]),
        rssi: rng.gen_range(-90..=-40),
        distance_cm: rng.gen_range(50..=1500),
        data: Bytes::new(),
    }
}
