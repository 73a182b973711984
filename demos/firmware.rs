//! Firmware - upgrade an anchor and follow the progress events.
//!
//! This example demonstrates:
//! - `Provider::firmware_upgrade` with an image file
//! - The enter-upgrade handshake and per-block acknowledgements
//! - `FirmwareProgress` events
//!
//! With the `serial` feature and a port argument it talks to a real anchor;
//! otherwise a simulated anchor accepts every block.
//!
//! ```sh
//! cargo run --example firmware -- image.bin
//! cargo run --example firmware --features serial -- image.bin /dev/ttyUSB0
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use rtls_provider::codec::{BlockAck, BlockWrite, EnterUpgradeAck, ErrorCode, Payload, Version, VersionInfo};
use rtls_provider::protocol::{DeviceId, Frame, FrameBuffer, MessageId};
use rtls_provider::transport::{loopback, DEFAULT_LOOPBACK_CAPACITY};
use rtls_provider::{FirmwareOutcome, Provider, ProviderBuilder, RtlsEvent};

const ANCHOR: DeviceId = DeviceId::new([0xA0, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let image = args.next().ok_or("usage: firmware <image.bin> [serial-port]")?;
    let port = args.next();

    let (provider, mut events) = connect(port).await?;

    while let Some(event) = events.recv().await {
        match event {
            RtlsEvent::Version(info) => {
                println!("anchor {} running {}", provider.anchor_id(), info.application);
                provider.firmware_upgrade(&image).await?;
            }
            RtlsEvent::FirmwareProgress(progress) => match progress.outcome {
                FirmwareOutcome::InProgress => println!("{:>3}%", progress.percent),
                FirmwareOutcome::Succeeded => {
                    println!("upgrade complete");
                    break;
                }
                FirmwareOutcome::Failed(reason) => {
                    eprintln!("upgrade failed at {}%: {}", progress.percent, reason);
                    break;
                }
            },
            RtlsEvent::TransportClosed | RtlsEvent::TransportError(_) => break,
            _ => {}
        }
    }

    provider.shutdown().await?;
    Ok(())
}

#[cfg(feature = "serial")]
async fn connect(
    port: Option<String>,
) -> rtls_provider::Result<(Provider, tokio::sync::mpsc::UnboundedReceiver<RtlsEvent>)> {
    match port {
        Some(path) => {
            ProviderBuilder::new()
                .start_serial(&path, rtls_provider::transport::DEFAULT_BAUD_RATE)
                .await
        }
        None => simulated().await,
    }
}

#[cfg(not(feature = "serial"))]
async fn connect(
    _port: Option<String>,
) -> rtls_provider::Result<(Provider, tokio::sync::mpsc::UnboundedReceiver<RtlsEvent>)> {
    simulated().await
}

async fn simulated(
) -> rtls_provider::Result<(Provider, tokio::sync::mpsc::UnboundedReceiver<RtlsEvent>)> {
    let (host, device) = loopback(DEFAULT_LOOPBACK_CAPACITY);
    tokio::spawn(simulated_anchor(device));

    let (reader, writer) = tokio::io::split(host);
    ProviderBuilder::new().start(reader, writer).await
}

async fn simulated_anchor(mut stream: DuplexStream) -> std::io::Result<()> {
    let mut buffer = FrameBuffer::new();
    let mut buf = [0u8; 2048];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in buffer.push(&buf[..n]).into_iter().flatten() {
            let mut replies = Vec::new();
            match frame.message_id {
                MessageId::GetVersion => replies.push(reply(&VersionInfo {
                    application: Version([1, 4, 0, 2]),
                    bootloader: Version([1, 0, 0, 0]),
                })?),
                MessageId::EnterFirmwareUpgrade => replies.push(reply(&EnterUpgradeAck {
                    error: ErrorCode::InBootloader,
                })?),
                MessageId::StartFirmwareUpgrade => {
                    let Ok(block) = BlockWrite::decode(frame.payload()) else {
                        continue;
                    };
                    replies.push(reply(&BlockAck {
                        error: ErrorCode::NoError,
                        block_index: block.block_index,
                    })?);
                    if block.block_index + 1 == block.total_blocks {
                        replies.push(reply(&BlockAck {
                            error: ErrorCode::WriteInfoOk,
                            block_index: block.block_index,
                        })?);
                    }
                }
                _ => {}
            }
            for wire in replies {
                stream.write_all(&wire).await?;
            }
        }
    }
}

fn reply<P: Payload>(payload: &P) -> std::io::Result<Vec<u8>> {
    Frame::new(ANCHOR, P::MESSAGE_ID, payload.encode())
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}
