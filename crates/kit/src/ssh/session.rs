use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::{diagnostics, Credentials, PrivateKey, RemoteChannel, SshError};

/// Upper bound for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout in milliseconds for blocking libssh2 calls outside of channel
/// reads (handshake, authentication, channel setup and teardown).
pub(super) const BLOCKING_TIMEOUT_MS: u32 = 30_000;

/// An established SSH connection to one host.
pub(crate) struct RemoteSession {
    session: ssh2::Session,
    host: String,
    username: String,
}

impl RemoteSession {
    /// Connect to `host:port` and complete the SSH handshake.
    pub(crate) fn connect(host: &str, port: u16, username: &str) -> Result<Self, SshError> {
        let connection_error = |source: std::io::Error| SshError::Connection {
            host: host.to_owned(),
            port,
            source,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(connection_error)?
            .next()
            .ok_or_else(|| {
                connection_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;
        debug!("Connecting to {addr} as {username}");
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(connection_error)?;

        let mut session = ssh2::Session::new().map_err(|e| connection_error(e.into()))?;
        if let Some(flags) = diagnostics() {
            session.trace(flags);
        }
        session.set_timeout(BLOCKING_TIMEOUT_MS);
        session.set_tcp_stream(tcp);
        // On failure the partially set up session and its socket are
        // dropped here, before the error propagates.
        session
            .handshake()
            .map_err(|e| connection_error(e.into()))?;

        Ok(Self {
            session,
            host: host.to_owned(),
            username: username.to_owned(),
        })
    }

    /// Authenticate the session user with `credentials`.
    pub(crate) fn authenticate(&self, credentials: &Credentials) -> Result<(), SshError> {
        let (method, result) = match credentials {
            Credentials::Identity(path) => {
                let key = PrivateKey::from_file(path)?;
                debug!("Authenticating as {} with {key} identity {path}", self.username);
                (
                    format!("identity {path}"),
                    self.session
                        .userauth_pubkey_file(&self.username, None, key.path().as_std_path(), None),
                )
            }
            Credentials::Password(password) => {
                debug!("Authenticating as {} with a password", self.username);
                (
                    "password".to_owned(),
                    self.session.userauth_password(&self.username, password),
                )
            }
        };

        let rejected = |source: Option<std::io::Error>| SshError::Authentication {
            username: self.username.clone(),
            method: method.clone(),
            source,
        };
        result.map_err(|e| rejected(Some(e.into())))?;
        if !self.session.authenticated() {
            return Err(rejected(None));
        }
        debug!("Authenticated to {}", self.host);
        Ok(())
    }

    /// Open a new session channel (not a forwarding channel).
    pub(crate) fn open_channel(&self) -> Result<RemoteChannel<'_>, SshError> {
        let channel = self
            .session
            .channel_session()
            .map_err(|e| SshError::Channel {
                action: "open a session",
                source: e.into(),
            })?;
        Ok(RemoteChannel::new(&self.session, channel))
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            debug!("Disconnecting from {} failed: {e}", self.host);
        }
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
