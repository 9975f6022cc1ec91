// SPDX-License-Identifier: Apache-2.0

//! Downstream delivery capability.

/// Receives complete log lines, one call per line, in file order.
///
/// `deliver` is synchronous and may block for backpressure; blocking is
/// confined to the worker thread driving that file's cursor. The tailer does
/// not retry deliveries — failure handling belongs to the implementor.
pub trait LineSink: Send + Sync {
    /// Deliver one record. The slice covers the line body without its
    /// trailing newline, except for oversized-line chunks and rotation
    /// final-flushes, which may carry an incomplete line.
    fn deliver(&self, line: &[u8]);
}

impl<F> LineSink for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn deliver(&self, line: &[u8]) {
        self(line)
    }
}
