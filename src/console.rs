//! Console output for the demand pager
//!
//! Kernel log output. Every line is kept in a fixed-size backlog so the log
//! can be read back after boot or from tests, and is forwarded to the
//! platform sink (UART driver) once one is installed.

use alloc::vec::Vec;
use core::fmt::{self, Write};
use heapless::HistoryBuffer;
use spin::Mutex;

/// Bytes of log kept in the backlog
pub const BACKLOG_SIZE: usize = 16 * 1024;

/// Platform output routine
pub type Sink = fn(&str);

/// Console writer interface
pub struct Console {
    backlog: HistoryBuffer<u8, BACKLOG_SIZE>,
    sink: Option<Sink>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            backlog: HistoryBuffer::new(),
            sink: None,
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        self.backlog.extend_from_slice(s.as_bytes());
        if let Some(sink) = self.sink {
            sink(s);
        }
    }

    /// Drop the backlog
    pub fn clear(&mut self) {
        self.backlog.clear();
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console subsystem
pub fn init() {
    CONSOLE.lock().clear();
}

/// Install the platform output routine
pub fn set_sink(sink: Sink) {
    CONSOLE.lock().sink = Some(sink);
}

/// Copy of the backlog, oldest byte first
pub fn backlog() -> Vec<u8> {
    CONSOLE.lock().backlog.oldest_ordered().copied().collect()
}

/// Whether the backlog contains `needle`
pub fn backlog_contains(needle: &str) -> bool {
    let needle = needle.as_bytes();
    needle.is_empty() || backlog().windows(needle.len()).any(|w| w == needle)
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_formatting() {
        let mut console = Console::new();
        write!(&mut console, "Test {}", 42).unwrap();
        let text: Vec<u8> = console.backlog.oldest_ordered().copied().collect();
        assert_eq!(text, b"Test 42");
    }

    #[test]
    fn test_backlog_wraps() {
        let mut console = Console::new();
        for _ in 0..BACKLOG_SIZE {
            console.write_str("x");
        }
        console.write_str("end");
        assert_eq!(console.backlog.len(), BACKLOG_SIZE);
        let tail: Vec<u8> = console.backlog.oldest_ordered().copied().collect();
        assert!(tail.ends_with(b"xend"));
    }

    #[test]
    fn test_sink_receives_output() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        fn count(s: &str) {
            SEEN.fetch_add(s.len(), Ordering::Relaxed);
        }

        let mut console = Console::new();
        console.sink = Some(count as Sink);
        console.write_str("abc");
        assert!(SEEN.load(Ordering::Relaxed) >= 3);

        set_sink(count);
        crate::print!("de");
        assert!(SEEN.load(Ordering::Relaxed) >= 5);
    }

    #[test]
    fn test_global_backlog() {
        crate::println!("console: marker 7731");
        assert!(backlog_contains("marker 7731"));
    }
}
