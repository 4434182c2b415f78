use std::time::Instant;

/// Sink for user-visible progress lines. The interactive surface implements
/// this; the core never renders anything itself.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, message: &str);
}

/// Discards everything. Useful for callers that only want the outcome.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _message: &str) {}
}

/// Wraps another sink and prefixes each line with the elapsed seconds since
/// the wrapped operation started.
pub struct ElapsedSink<'a> {
    inner: &'a dyn ProgressSink,
    started: Instant,
}

impl<'a> ElapsedSink<'a> {
    pub fn new(inner: &'a dyn ProgressSink) -> Self {
        Self {
            inner,
            started: Instant::now(),
        }
    }
}

impl ProgressSink for ElapsedSink<'_> {
    fn progress(&self, message: &str) {
        let elapsed = self.started.elapsed().as_secs();
        self.inner.progress(&format!("[{elapsed}s] {message}"));
    }
}

pub mod testing {
    use std::sync::Mutex;

    use super::ProgressSink;

    /// Collects progress lines in memory for assertions.
    #[derive(Default)]
    pub struct MemorySink {
        lines: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().expect("sink lock").clone()
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.lines().iter().any(|line| line.contains(needle))
        }
    }

    impl ProgressSink for MemorySink {
        fn progress(&self, message: &str) {
            self.lines.lock().expect("sink lock").push(message.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;

    #[test]
    fn elapsed_sink_prefixes_messages() {
        let inner = MemorySink::new();
        let sink = ElapsedSink::new(&inner);
        sink.progress("booting");

        let lines = inner.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("s] booting"));
    }
}
