//! Download progress reporting.

use std::pin::Pin;
use std::task::{Context, Poll};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWrite;

/// Progress bar for one file, fed by the sink wrapper.
pub fn transfer_bar(name: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}: {bytes} ({bytes_per_sec})")
            .expect("static template"),
    );
    bar.set_message(name.to_string());
    bar
}

/// Sink wrapper that advances a progress bar as bytes are written
pub struct ProgressSink<W> {
    inner: W,
    bar: ProgressBar,
}

impl<W> ProgressSink<W> {
    pub fn new(inner: W, bar: ProgressBar) -> Self {
        Self { inner, bar }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressSink<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.bar.inc(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if matches!(result, Poll::Ready(Ok(()))) {
            self.bar.finish();
        }
        result
    }
}

/// Human-readable byte count, IEC units.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut divisor = UNIT;
    let mut exponent = 0;
    let mut reduced = bytes / UNIT;
    while reduced >= UNIT {
        divisor *= UNIT;
        exponent += 1;
        reduced /= UNIT;
    }
    let units = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    format!("{:.1} {}", bytes as f64 / divisor as f64, units[exponent])
}
