//! Secure shell transport to the guest, on top of libssh2.
//!
//! A [`RemoteSession`] owns one authenticated connection; it disconnects
//! when dropped. A [`RemoteChannel`] borrows its session and runs exactly one
//! command, streaming the remote stdout and stderr back as they arrive.

use std::sync::OnceLock;

use camino::Utf8PathBuf;
use thiserror::Error;

mod channel;
mod key;
mod session;

pub(crate) use channel::{RemoteChannel, Stream};
pub(crate) use key::PrivateKey;
pub(crate) use session::RemoteSession;

/// Errors raised while talking to the guest's SSH server.
#[derive(Debug, Error)]
pub(crate) enum SshError {
    #[error("Unable to connect to {host}:{port}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not import private key at {path}: {reason}")]
    KeyImport { path: Utf8PathBuf, reason: String },

    #[error("Could not authenticate as {username} with {method}")]
    Authentication {
        username: String,
        method: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The channel could not be allocated, opened or asked to execute.
    #[error("The channel could not {action}")]
    Channel {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Reading from remote {stream} failed")]
    ProtocolRead {
        stream: Stream,
        #[source]
        source: std::io::Error,
    },

    #[error("Forwarding remote {stream} locally failed")]
    Forward {
        stream: Stream,
        #[source]
        source: std::io::Error,
    },
}

/// How the session proves the user's identity.
#[derive(Clone)]
pub(crate) enum Credentials {
    /// Public key authentication with a private key file.
    Identity(Utf8PathBuf),
    /// Username/password authentication.
    Password(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Identity(path) => f.debug_tuple("Identity").field(path).finish(),
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// libssh2 trace flags, decided once per process from the log filter.
static DIAGNOSTICS: OnceLock<Option<ssh2::TraceFlags>> = OnceLock::new();

/// Initialize libssh2 diagnostics; later calls return the first decision.
pub(crate) fn diagnostics() -> Option<ssh2::TraceFlags> {
    *DIAGNOSTICS.get_or_init(|| {
        let enabled = tracing::enabled!(target: "fusion_executor::ssh", tracing::Level::TRACE);
        if enabled {
            tracing::trace!("Enabling libssh2 protocol tracing");
        }
        enabled.then(|| {
            ssh2::TraceFlags::AUTH
                | ssh2::TraceFlags::CONN
                | ssh2::TraceFlags::KEX
                | ssh2::TraceFlags::ERROR
        })
    })
}

/// Run `command` on `host` and report whether it exited successfully.
///
/// A fresh session is opened for every probe so that no state from a
/// failed handshake is reused.
pub(crate) fn probe(
    host: &str,
    port: u16,
    username: &str,
    credentials: &Credentials,
    command: &str,
) -> Result<i32, SshError> {
    let session = RemoteSession::connect(host, port, username)?;
    session.authenticate(credentials)?;
    let mut channel = session.open_channel()?;
    channel.execute(command, &mut std::io::sink(), &mut std::io::sink())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_is_stable() {
        let first = diagnostics();
        for _ in 0..3 {
            assert_eq!(diagnostics().map(|f| f.bits()), first.map(|f| f.bits()));
        }
    }

    #[test]
    fn test_password_is_not_debug_printed() {
        let creds = Credentials::Password("hunter2".into());
        assert!(!format!("{creds:?}").contains("hunter2"));
        let creds = Credentials::Identity("/keys/id_ed25519".into());
        assert!(format!("{creds:?}").contains("/keys/id_ed25519"));
    }

    #[test]
    fn test_probe_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = probe(
            "127.0.0.1",
            port,
            "buildbot",
            &Credentials::Password("x".into()),
            "true",
        )
        .unwrap_err();
        assert!(matches!(err, SshError::Connection { .. }), "{err:?}");
    }
}
