//! Line-discipline emulation for processes that run without a PTY.
//!
//! A client terminal expects CR-LF line endings and, for most interactive
//! programs, local echo. With plain pipes nobody does that translation, so
//! the piped process wraps its streams in these filters.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use tether_shell::PipeWriter;

/// Which translations to apply to a piped process's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtyOptions {
    /// Echo client input back on the output stream.
    pub echo: bool,
    /// Map NL to CR-NL on output.
    pub onlcr: bool,
    /// Map CR to NL on input.
    pub icrnl: bool,
}

impl TtyOptions {
    /// No translation at all.
    pub const RAW: TtyOptions = TtyOptions {
        echo: false,
        onlcr: false,
        icrnl: false,
    };

    /// What a client typing into a line-oriented program expects.
    pub fn interactive() -> Self {
        Self {
            echo: true,
            onlcr: true,
            icrnl: true,
        }
    }
}

impl Default for TtyOptions {
    fn default() -> Self {
        Self {
            echo: false,
            onlcr: true,
            icrnl: false,
        }
    }
}

/// Output sink shared by the stdout copier and input echo. Set to `None`
/// once the process output is finished so the reader sees EOF.
pub(crate) type SharedSink = Arc<Mutex<Option<PipeWriter>>>;

/// Reader that expands NL into CR-NL.
pub struct OnlcrReader<R> {
    inner: R,
    pending: Vec<u8>,
    pos: usize,
}

impl<R: Read> OnlcrReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl<R: Read> Read for OnlcrReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos == self.pending.len() {
            let mut raw = [0u8; 4096];
            let n = self.inner.read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }
            self.pending.clear();
            self.pos = 0;
            for &b in &raw[..n] {
                if b == b'\n' {
                    self.pending.push(b'\r');
                }
                self.pending.push(b);
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Writer in front of a process's stdin: CR to NL translation and local
/// echo into the shared output sink.
pub struct TtyInput<W> {
    inner: W,
    icrnl: bool,
    echo: Option<SharedSink>,
}

impl<W: Write> TtyInput<W> {
    pub(crate) fn new(inner: W, options: TtyOptions, sink: &SharedSink) -> Self {
        Self {
            inner,
            icrnl: options.icrnl,
            echo: options.echo.then(|| Arc::clone(sink)),
        }
    }
}

impl<W: Write> Write for TtyInput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let translated: Vec<u8> = if self.icrnl {
            buf.iter()
                .map(|&b| if b == b'\r' { b'\n' } else { b })
                .collect()
        } else {
            buf.to_vec()
        };

        self.inner.write_all(&translated)?;

        if let Some(sink) = &self.echo {
            if let Ok(mut guard) = sink.lock() {
                if let Some(out) = guard.as_mut() {
                    // Echo is best effort; the process input already went through.
                    let _ = out.write_all(&translated);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
