// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Capped input streams for file staging.
//!
//! `submit_file` declares a byte length up front. The adapter must read at
//! most that many bytes - a misbehaving sender must not be able to bleed
//! into the next parameter's bytes - and must skip whatever it did not
//! consume before returning, so the connection stays usable.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

/// An [`AsyncRead`] capped at a declared length.
///
/// Reads report EOF once the declared length is consumed, regardless of
/// how much data the underlying stream still holds inside the window.
pub struct CappedReader<R> {
    inner: Take<R>,
}

impl<R: AsyncRead + Unpin> CappedReader<R> {
    /// Cap `reader` at `length` bytes.
    pub fn new(reader: R, length: u64) -> Self {
        Self {
            inner: reader.take(length),
        }
    }

    /// Bytes of the declared window not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    /// Skip all unread bytes of the declared window.
    ///
    /// Returns the number of bytes discarded. Safe to call after a partial
    /// read; a short underlying stream simply ends the drain early.
    pub async fn drain(&mut self) -> io::Result<u64> {
        let mut scratch = [0u8; 8192];
        let mut discarded = 0u64;
        while self.inner.limit() > 0 {
            let n = self.inner.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            discarded += n as u64;
        }
        Ok(discarded)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CappedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
