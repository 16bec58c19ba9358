//! Private key import and identification.

use base64::Engine as _;
use camino::{Utf8Path, Utf8PathBuf};

use super::SshError;

const OPENSSH_MAGIC: &[u8] = b"openssh-key-v1\0";

/// A private key file that has been checked to contain a PEM encoded key.
#[derive(Debug, Clone)]
pub(crate) struct PrivateKey {
    path: Utf8PathBuf,
    key_type: String,
}

impl PrivateKey {
    /// Read and identify the private key at `path`.
    pub(crate) fn from_file(path: &Utf8Path) -> Result<Self, SshError> {
        let import_error = |reason: String| SshError::KeyImport {
            path: path.to_owned(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| import_error(e.to_string()))?;
        if contents.trim().is_empty() {
            return Err(import_error("file is empty".into()));
        }
        let key_type = identify(&contents)
            .ok_or_else(|| import_error("not a recognized private key format".into()))?;
        Ok(Self {
            path: path.to_owned(),
            key_type,
        })
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The SSH name of the key algorithm, e.g. `ssh-ed25519`.
    pub(crate) fn key_type(&self) -> &str {
        &self.key_type
    }
}

impl std::fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_type())
    }
}

/// Identify a PEM encoded private key, returning its algorithm name.
///
/// The body must decode. Apart from `openssh-key-v1` blobs it must hold a
/// single DER `SEQUENCE`, unless RFC 1421 headers mark it as encrypted.
fn identify(contents: &str) -> Option<String> {
    let mut lines = contents.trim().lines().map(str::trim);
    let label = lines
        .next()?
        .strip_prefix("-----BEGIN ")?
        .strip_suffix("-----")?;
    let end = format!("-----END {label}-----");
    let body: Vec<&str> = lines.take_while(|l| *l != end).collect();
    if !contents.trim_end().ends_with(&end) {
        return None;
    }

    // Legacy OpenSSL keys may carry `Proc-Type` and `DEK-Info` headers,
    // separated from the data by a blank line.
    let (headers, data) = match body.iter().position(|l| l.is_empty()) {
        Some(i) if body[..i].iter().all(|l| l.contains(':')) => (&body[..i], &body[i + 1..]),
        _ => (&[][..], &body[..]),
    };
    let der = base64::engine::general_purpose::STANDARD
        .decode(data.concat())
        .ok()
        .filter(|d| !d.is_empty())?;
    let encrypted = headers
        .iter()
        .any(|h| h.starts_with("Proc-Type:") && h.ends_with("ENCRYPTED"));

    let key_type = match label {
        "OPENSSH PRIVATE KEY" => return openssh_key_type(&der),
        "RSA PRIVATE KEY" => "ssh-rsa",
        "DSA PRIVATE KEY" => "ssh-dss",
        "EC PRIVATE KEY" => "ecdsa",
        "PRIVATE KEY" | "ENCRYPTED PRIVATE KEY" => "pkcs8",
        _ => return None,
    };
    (encrypted || is_der_sequence(&der)).then(|| key_type.to_owned())
}

/// Whether `der` is exactly one DER `SEQUENCE` (X.690 section 8.1).
fn is_der_sequence(der: &[u8]) -> bool {
    let Some((&0x30, rest)) = der.split_first() else {
        return false;
    };
    let Some((&first, mut rest)) = rest.split_first() else {
        return false;
    };
    let len = if first < 0x80 {
        usize::from(first)
    } else {
        let n = usize::from(first & 0x7f);
        if n == 0 || n > std::mem::size_of::<u32>() || rest.len() < n {
            return false;
        }
        let (octets, content) = rest.split_at(n);
        rest = content;
        octets
            .iter()
            .fold(0usize, |len, octet| (len << 8) | usize::from(*octet))
    };
    rest.len() == len
}

/// Read the key type from the first public key of an `openssh-key-v1` blob.
fn openssh_key_type(blob: &[u8]) -> Option<String> {
    let mut reader = SshReader(blob.strip_prefix(OPENSSH_MAGIC)?);
    let _cipher = reader.string()?;
    let _kdf = reader.string()?;
    let _kdf_options = reader.string()?;
    if reader.u32()? == 0 {
        return None;
    }
    let public_key = reader.string()?;
    let key_type = SshReader(public_key).string()?;
    String::from_utf8(key_type.to_vec()).ok()
}

/// Cursor over the SSH wire encoding (RFC 4251 section 5).
struct SshReader<'a>(&'a [u8]);

impl<'a> SshReader<'a> {
    fn u32(&mut self) -> Option<u32> {
        let (head, rest) = self.0.split_first_chunk::<4>()?;
        self.0 = rest;
        Some(u32::from_be_bytes(*head))
    }

    fn string(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.u32()?).ok()?;
        if self.0.len() < len {
            return None;
        }
        let (s, rest) = self.0.split_at(len);
        self.0 = rest;
        Some(s)
    }
}
