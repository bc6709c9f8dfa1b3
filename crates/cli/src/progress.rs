//! Cargo-style status output for swarmsync
//!
//! ```text
//!     Chunked 952 files into 14808 blocks (67.44 MiB)
//!      Online desktop at 127.0.0.1:40231
//!      Status laptop: Applying modifications...
//! ```

use std::io::Write as _;
use std::time::{Duration, Instant};

use tracing_subscriber::fmt::MakeWriter;

/// Status verbs, right-aligned to 12 chars
pub struct Status;

impl Status {
    pub const CHUNKED: &str = "Chunked";
    pub const DETECTED: &str = "Detected";
    pub const RECONCILED: &str = "Reconciled";
    pub const APPLIED: &str = "Applied";
    pub const WROTE: &str = "Wrote";
    pub const ONLINE: &str = "Online";
    pub const DEVICE: &str = "Device";
    pub const STATUS: &str = "Status";
    pub const UNCHANGED: &str = "Unchanged";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

pub fn print_warning(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().yellow().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

#[must_use]
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Wall-clock timer for a single command
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Print the final line with the elapsed time appended
    pub fn finish(&self, status: &str, message: &str) {
        let elapsed = format_elapsed(self.start.elapsed());
        print_status(status, &format!("{message} in {elapsed}"));
    }
}

/// Console log writer sharing stderr with the status lines
pub struct ProgressWriter;

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = std::io::Stderr;

    fn make_writer(&'a self) -> Self::Writer {
        std::io::stderr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_millis(3200)), "3.20s");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2 KiB");
    }
}
