use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

/// Output drained from an [`OutputBuffer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    pub text: String,
    /// Bytes discarded since the previous draining read
    pub dropped_bytes: u64,
}

/// Bounded accumulator for a session's stdout and stderr.
///
/// When `limit` is exceeded the oldest bytes are discarded and counted, so a
/// reader that falls behind loses history instead of stalling the shell.
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    data: VecDeque<u8>,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Append bytes read from the process, evicting from the front on overflow.
    pub fn push(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        inner.data.extend(bytes);

        let excess = inner.data.len().saturating_sub(self.limit);
        if excess > 0 {
            inner.data.drain(..excess);
            inner.dropped += excess as u64;
            debug!(excess, total_dropped = inner.dropped, "output buffer overflow");
        }
    }

    /// Remove and return everything buffered.
    ///
    /// With `hold_partial`, an incomplete UTF-8 sequence at the end stays in
    /// the buffer until the rest of it arrives.
    pub fn drain(&self, hold_partial: bool) -> OutputChunk {
        let mut inner = self.lock();
        let keep = if hold_partial {
            incomplete_tail_len(inner.data.make_contiguous())
        } else {
            0
        };
        let take = inner.data.len() - keep;
        let bytes: Vec<u8> = inner.data.drain(..take).collect();
        let dropped_bytes = std::mem::take(&mut inner.dropped);

        OutputChunk {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            dropped_bytes,
        }
    }

    /// Copy of the buffered output; nothing is removed.
    pub fn peek(&self) -> OutputChunk {
        let mut inner = self.lock();
        let dropped_bytes = inner.dropped;
        let bytes = inner.data.make_contiguous();
        let complete = &bytes[..bytes.len() - incomplete_tail_len(bytes)];

        OutputChunk {
            text: String::from_utf8_lossy(complete).into_owned(),
            dropped_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicked reader task leaves the bytes intact.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Length of a UTF-8 sequence cut off at the end of `bytes`, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            // unexpected end of input: the tail is a truncated sequence
            Err(err) => match err.error_len() {
                None => return rest.len() - err.valid_up_to(),
                Some(invalid) => rest = &rest[err.valid_up_to() + invalid..],
            },
        }
    }
}
