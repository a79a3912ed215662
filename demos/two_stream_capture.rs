//! # Two-Stream Capture
//!
//! A preview stream repeats for a while, then single captures are issued
//! across preview and still together. Each capture reports one shutter and one
//! result, shared by both streams.
//!
//! ```text
//! [preview_src] → [preview_sink]
//! [still_src]   → [still_sink]
//! ```
//!
//! Run: `cargo run --example two_stream_capture`

use campipe::prelude::*;
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("campipe=debug")),
        )
        .init();

    let spec = PipelineSpec::new().with_mode(
        "photo",
        GraphSpec::direct(&[StreamIntent::Preview, StreamIntent::Still]),
    );
    let session = CaptureSession::new(SessionConfig::default(), spec)?;

    let preview = session.create_stream(StreamIntent::Preview);
    let still = session.create_stream(StreamIntent::Still);
    session.commit_stream(preview, StreamConfig::preview(640, 480))?;
    session.commit_stream(still, StreamConfig::still(1280, 960))?;
    session.build_pipeline("photo")?;

    let events = session.notifications();
    let repeating = session.capture(&[preview], CaptureOptions::repeating())?;
    println!("Preview running as {}", repeating);
    std::thread::sleep(Duration::from_millis(200));

    // A repeating request holds the queue head until cancelled
    session.cancel_capture(repeating)?;

    for _ in 0..3 {
        let shot = session.capture(&[preview, still], CaptureOptions::still())?;

        while let Ok(event) = events.recv_timeout(Duration::from_secs(2)) {
            if event.capture_id != shot {
                continue;
            }
            println!(
                "[{}] {} at {} from {:?} ({:?})",
                shot,
                event.kind.as_str(),
                event.timestamp,
                event.streams,
                event.statuses
            );
            if event.kind == MessageKind::Result || event.kind == MessageKind::Error {
                break;
            }
        }
    }

    session.stop_stream(preview)?;
    session.stop_stream(still)?;
    session.shutdown();
    println!("\nDone");
    Ok(())
}
