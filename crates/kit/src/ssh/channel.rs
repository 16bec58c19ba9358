use std::io::{ErrorKind, Read, Write};

use tracing::{debug, trace};

use super::session::BLOCKING_TIMEOUT_MS;
use super::SshError;

/// Per-read timeout while pumping output, in milliseconds. This bounds how
/// long one sub-stream can starve the other.
const READ_TIMEOUT_MS: u32 = 250;

/// One of the two logical streams multiplexed over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// The operations needed to demultiplex a running command's output.
pub(crate) trait ChannelStreams {
    /// Read whatever is available on `stream` into `buf`, waiting at most
    /// the per-read timeout. `Ok(0)` means nothing arrived in time.
    fn read_stream(&mut self, stream: Stream, buf: &mut [u8]) -> Result<usize, SshError>;

    /// Whether the remote has signaled end of stream.
    fn is_eof(&self) -> bool;

    /// Close the channel and return the remote process' exit status.
    fn exit_status(&mut self) -> Result<i32, SshError>;
}

/// Size of the read buffer: a few memory pages.
fn read_buffer_size() -> usize {
    4 * rustix::param::page_size()
}

/// Forward output from `streams` until end of stream, then return the exit
/// status of the remote command.
///
/// There is no readiness notification across the two sub-streams, so each
/// iteration polls stdout then stderr with a bounded read.
pub(crate) fn pump_streams<S: ChannelStreams + ?Sized>(
    streams: &mut S,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<i32, SshError> {
    let mut buf = vec![0u8; read_buffer_size()];
    while !streams.is_eof() {
        forward(streams, Stream::Stdout, &mut buf, stdout)?;
        forward(streams, Stream::Stderr, &mut buf, stderr)?;
    }
    // Data may still be buffered locally behind the EOF.
    while forward(streams, Stream::Stdout, &mut buf, stdout)? > 0 {}
    while forward(streams, Stream::Stderr, &mut buf, stderr)? > 0 {}
    stdout.flush().map_err(|source| SshError::Forward {
        stream: Stream::Stdout,
        source,
    })?;
    stderr.flush().map_err(|source| SshError::Forward {
        stream: Stream::Stderr,
        source,
    })?;
    streams.exit_status()
}

fn forward<S: ChannelStreams + ?Sized>(
    streams: &mut S,
    stream: Stream,
    buf: &mut [u8],
    sink: &mut dyn Write,
) -> Result<usize, SshError> {
    let n = streams.read_stream(stream, buf)?;
    if n > 0 {
        trace!("{n} bytes on {stream}");
        sink.write_all(&buf[..n])
            .map_err(|source| SshError::Forward { stream, source })?;
    }
    Ok(n)
}

/// Interpret the outcome of one bounded read. A read that timed out is not
/// an error, it just produced nothing.
fn bounded_read(stream: Stream, result: std::io::Result<usize>) -> Result<usize, SshError> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
        Err(source) => Err(SshError::ProtocolRead { stream, source }),
    }
}

/// A session channel that executes a single command.
pub(crate) struct RemoteChannel<'s> {
    session: &'s ssh2::Session,
    channel: ssh2::Channel,
}

impl<'s> RemoteChannel<'s> {
    pub(super) fn new(session: &'s ssh2::Session, channel: ssh2::Channel) -> Self {
        Self { session, channel }
    }

    /// Run `command` without a shell prompt or pty, forwarding its stdout
    /// and stderr, and return its exit status.
    ///
    /// A nonzero exit status is returned as a value. Only failures of the
    /// channel itself are errors.
    pub(crate) fn execute(
        &mut self,
        command: &str,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<i32, SshError> {
        self.channel.exec(command).map_err(|e| SshError::Channel {
            action: "request command execution",
            source: e.into(),
        })?;
        self.session.set_timeout(READ_TIMEOUT_MS);
        let result = pump_streams(self, stdout, stderr);
        self.session.set_timeout(BLOCKING_TIMEOUT_MS);
        result
    }
}

impl ChannelStreams for RemoteChannel<'_> {
    fn read_stream(&mut self, stream: Stream, buf: &mut [u8]) -> Result<usize, SshError> {
        let result = match stream {
            Stream::Stdout => self.channel.read(buf),
            Stream::Stderr => self.channel.stderr().read(buf),
        };
        bounded_read(stream, result)
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn exit_status(&mut self) -> Result<i32, SshError> {
        self.session.set_timeout(BLOCKING_TIMEOUT_MS);
        self.channel.wait_close().map_err(|e| SshError::Channel {
            action: "close",
            source: e.into(),
        })?;
        let status = self.channel.exit_status().map_err(|e| SshError::Channel {
            action: "report an exit status",
            source: e.into(),
        })?;
        debug!("Remote command exited with {status}");
        Ok(status)
    }
}

impl Drop for RemoteChannel<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.channel.close() {
            trace!("Closing channel failed: {e}");
        }
    }
}
