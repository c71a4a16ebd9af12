//! OpenSSH `authorized_keys` parsing and public key authentication.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info};

use super::handler::{AuthContext, AuthHandler, AuthMethod, AuthResult};
use crate::Result;

/// Key types accepted in `authorized_keys` lines.
const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// A client public key in OpenSSH text form.
#[derive(Debug, Clone)]
pub struct PublicKey {
    /// Key type, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// Base64 wire encoding of the key.
    pub base64: String,
    /// Comment, usually `user@host`.
    pub comment: Option<String>,
}

impl PublicKey {
    /// Creates a key.
    pub fn new(key_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            base64: base64.into(),
            comment: None,
        }
    }

    /// Converts a key offered by an SSH client.
    pub fn from_russh(key: &russh_keys::key::PublicKey) -> Self {
        Self::new(key.name(), key.public_key_base64())
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type && self.base64 == other.base64
    }
}

impl Eq for PublicKey {}

/// One entry of an `authorized_keys` file.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// The key.
    pub key: PublicKey,
    /// Leading options such as `no-pty`.
    pub options: Vec<String>,
}

impl AuthorizedKey {
    /// Returns true if this entry authorizes `key`.
    pub fn matches(&self, key: &PublicKey) -> bool {
        self.key == *key
    }
}

/// Parses `authorized_keys` content.
///
/// Each line is `[options] key-type base64 [comment]`. Blank lines, `#`
/// comments and lines with an unknown key type are skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parsed = parse_line(line);
            if parsed.is_none() {
                debug!(line = %line, "Skipping unparsable authorized_keys line");
            }
            parsed
        })
        .collect()
}

fn parse_line(line: &str) -> Option<AuthorizedKey> {
    let (first, rest) = split_word(line);
    let (options, key_type, rest) = if KEY_TYPES.contains(&first) {
        (Vec::new(), first, rest)
    } else {
        let (field, rest) = split_options_field(line);
        let (key_type, rest) = split_word(rest);
        if !KEY_TYPES.contains(&key_type) {
            return None;
        }
        (split_options(field), key_type, rest)
    };

    let (data, comment) = split_word(rest);
    if data.is_empty() {
        return None;
    }
    let comment = (!comment.is_empty()).then(|| comment.to_string());

    Some(AuthorizedKey {
        key: PublicKey {
            key_type: key_type.to_string(),
            base64: data.to_string(),
            comment,
        },
        options,
    })
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    }
}

/// Splits off the leading options field, which may contain quoted spaces.
fn split_options_field(line: &str) -> (&str, &str) {
    let mut quoted = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => return (&line[..i], line[i..].trim()),
            _ => {}
        }
    }
    (line, "")
}

/// Splits an options field on commas outside double quotes.
fn split_options(field: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in field.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            ',' if !quoted => options.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        options.push(current);
    }
    options
}

/// Public key authentication against an `authorized_keys` file.
///
/// The file is read once at construction; [`reload`](Self::reload) re-reads it.
#[derive(Debug)]
pub struct AuthorizedKeysAuth {
    path: PathBuf,
    keys: RwLock<Vec<AuthorizedKey>>,
}

impl AuthorizedKeysAuth {
    /// Loads keys from `path`. A leading `~/` expands to `$HOME`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be read.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let auth = Self {
            path: expand_tilde(path.as_ref()),
            keys: RwLock::new(Vec::new()),
        };
        auth.reload()?;
        Ok(auth)
    }

    /// Creates a handler from already parsed keys.
    pub fn from_keys(keys: Vec<AuthorizedKey>) -> Self {
        Self {
            path: PathBuf::new(),
            keys: RwLock::new(keys),
        }
    }

    /// Re-reads the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be read;
    /// the previously loaded keys stay in effect.
    pub fn reload(&self) -> Result<usize> {
        let content = std::fs::read_to_string(&self.path)?;
        let keys = parse_authorized_keys(&content);
        let count = keys.len();
        *self.keys.write() = keys;
        info!(path = %self.path.display(), count, "Loaded authorized keys");
        Ok(count)
    }

    /// Number of loaded keys.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    /// Path of the keys file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuthHandler for AuthorizedKeysAuth {
    async fn auth_publickey(&self, ctx: &AuthContext, key: &PublicKey) -> AuthResult {
        let keys = self.keys.read();
        match keys.iter().find(|ak| ak.matches(key)) {
            Some(ak) => {
                info!(
                    username = %ctx.username(),
                    key_type = %key.key_type,
                    comment = ak.key.comment.as_deref().unwrap_or("<none>"),
                    "AuthorizedKeysAuth: accepted"
                );
                AuthResult::Accept
            }
            None => {
                debug!(
                    username = %ctx.username(),
                    remote_addr = %ctx.remote(),
                    key_count = keys.len(),
                    "AuthorizedKeysAuth: no matching key"
                );
                AuthResult::Reject
            }
        }
    }

    fn supported_methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::PublicKey]
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    expand_tilde_with_home(path, home.as_deref())
}

fn expand_tilde_with_home(path: &Path, home: Option<&Path>) -> PathBuf {
    let text = path.to_string_lossy();
    match (text.strip_prefix("~/"), home) {
        (Some(stripped), Some(home)) => home.join(stripped),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ED25519: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIG1cILnhxkg+kMsGsVJP7hQnfKSPPIP/8GSXTE2n/8SE";

    #[test]
    fn test_parse_simple_key() {
        let keys = parse_authorized_keys(&format!("ssh-ed25519 {ED25519} user@example.com"));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key.key_type, "ssh-ed25519");
        assert_eq!(keys[0].key.base64, ED25519);
        assert_eq!(keys[0].key.comment.as_deref(), Some("user@example.com"));
        assert!(keys[0].options.is_empty());
    }

    #[test]
    fn test_parse_key_with_options() {
        let line = format!(r#"no-pty,command="echo a,b" ssh-ed25519 {ED25519} git@server"#);
        let keys = parse_authorized_keys(&line);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].options, vec!["no-pty", r#"command="echo a,b""#]);
    }

    #[test]
    fn test_parse_skips_comments_and_garbage() {
        let content = format!(
            "# comment\n\nssh-ed25519 {ED25519}\nnot-a-key AAAA\nssh-rsa\n  ssh-rsa AAAAB3NzaC1yc2E second\n"
        );
        let keys = parse_authorized_keys(&content);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key.comment, None);
        assert_eq!(keys[1].key.key_type, "ssh-rsa");
    }

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/test");
        assert_eq!(
            expand_tilde_with_home(Path::new("~/.ssh/authorized_keys"), Some(home)),
            PathBuf::from("/home/test/.ssh/authorized_keys")
        );
        assert_eq!(
            expand_tilde_with_home(Path::new("/etc/keys"), Some(home)),
            PathBuf::from("/etc/keys")
        );
        assert_eq!(
            expand_tilde_with_home(Path::new("~/keys"), None),
            PathBuf::from("~/keys")
        );
    }

    #[tokio::test]
    async fn test_authorized_keys_auth_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ssh-ed25519 {ED25519} alice@laptop").unwrap();

        let auth = AuthorizedKeysAuth::new(file.path()).unwrap();
        assert_eq!(auth.key_count(), 1);

        let ctx = AuthContext::new("alice", None, 1);
        let offered = PublicKey::new("ssh-ed25519", ED25519);
        assert!(auth.auth_publickey(&ctx, &offered).await.is_accepted());

        let other = PublicKey::new("ssh-ed25519", "AAAAC3NzaC1lZDI1NTE5AAAAIHUFrQ");
        assert!(!auth.auth_publickey(&ctx, &other).await.is_accepted());
    }

    #[test]
    fn test_reload_keeps_keys_on_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), format!("ssh-ed25519 {ED25519}\n")).unwrap();
        let auth = AuthorizedKeysAuth::new(file.path()).unwrap();

        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
        assert!(auth.reload().is_err());
        assert_eq!(auth.key_count(), 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AuthorizedKeysAuth::new("/nonexistent/termhost/authorized_keys").unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
