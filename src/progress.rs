//! Progress bars for the command line, fed from transfer events.

use indicatif::{ProgressBar, ProgressStyle};
use zmx::TransferEvent;

/// One bar per file, drawn on stderr.
pub struct TransferProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl TransferProgress {
    pub fn new(quiet: bool) -> Self {
        Self { bar: None, quiet }
    }

    /// Update the display. Returns true for the session's terminal event.
    pub fn handle(&mut self, event: &TransferEvent) -> bool {
        match event {
            TransferEvent::FileStart { name, size } => {
                self.finish(None);
                if !self.quiet {
                    self.bar = Some(file_bar(*size, name));
                }
            }
            TransferEvent::Progress { transferred, .. } => {
                if let Some(bar) = &self.bar {
                    bar.set_position(*transferred);
                }
            }
            TransferEvent::FileComplete { name, path } => {
                self.finish(Some(format!("{} -> {}", name, path.display())));
            }
            TransferEvent::FileSkipped { name } => {
                self.abandon();
                if !self.quiet {
                    eprintln!("Skipped {}", name);
                }
            }
            TransferEvent::Error { message } => {
                self.abandon();
                eprintln!("Transfer failed: {}", message);
                return true;
            }
            TransferEvent::SessionComplete { file_count } => {
                self.finish(None);
                if !self.quiet {
                    eprintln!("{} file(s) transferred", file_count);
                }
                return true;
            }
            TransferEvent::Cancelled => {
                self.abandon();
                eprintln!("Transfer cancelled");
                return true;
            }
        }
        false
    }

    fn finish(&mut self, message: Option<String>) {
        if let Some(bar) = self.bar.take() {
            match message {
                Some(msg) => bar.finish_with_message(msg),
                None => bar.finish(),
            }
        }
    }

    fn abandon(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

fn file_bar(size: u64, name: &str) -> ProgressBar {
    let bar = ProgressBar::new(size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{msg}\n[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(name.to_string());
    bar
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
