//! FastCFS credentials taken from CSI secrets.
//!
//! The pool and fuse tools only accept the secret key from a file, so every set of credentials
//! stages its key into a private temporary file which lives exactly as long as the
//! `Credentials` value.
use snafu::{ResultExt, Snafu};
use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// Secret entry holding the admin user name.
pub const ADMIN_NAME: &str = "adminName";
/// Secret entry holding the admin secret key.
pub const ADMIN_SECRET_KEY: &str = "adminSecretKey";
/// Secret entry holding the user name, for pre-provisioned volumes.
pub const USER_NAME: &str = "userName";
/// Secret entry holding the user secret key, for pre-provisioned volumes.
pub const USER_SECRET_KEY: &str = "userSecretKey";
/// Directory where key files are staged.
pub const KEY_FILE_DIR: &str = "/tmp/csi/keys";
const KEY_FILE_PREFIX: &str = "keyfile-";

/// Credential errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("Provided secret is empty"))]
    EmptySecrets {},
    #[snafu(display("Missing ID field '{}' in secrets", field))]
    MissingId { field: &'static str },
    #[snafu(display("Missing key field '{}' in secrets", field))]
    MissingKey { field: &'static str },
    #[snafu(display("Failed to stage key file in {}: {}", dir.display(), source))]
    KeyFile {
        source: std::io::Error,
        dir: PathBuf,
    },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::KeyFile { .. } => tonic::Status::internal(error.to_string()),
            _ => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}

/// Which pair of secret entries to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Controller operations and dynamically provisioned volumes.
    Admin,
    /// Statically provisioned volumes.
    User,
}

impl CredentialKind {
    /// Pre-provisioned volumes are mounted as their user, everything else as the admin.
    pub fn for_volume(pre_provisioned: bool) -> Self {
        match pre_provisioned {
            true => Self::User,
            false => Self::Admin,
        }
    }
    fn fields(&self) -> (&'static str, &'static str) {
        match self {
            Self::Admin => (ADMIN_NAME, ADMIN_SECRET_KEY),
            Self::User => (USER_NAME, USER_SECRET_KEY),
        }
    }
}

/// A FastCFS user with its key staged into a file.
#[derive(Debug)]
pub struct Credentials {
    user_name: String,
    key_file: NamedTempFile,
}

impl Credentials {
    /// Build the credentials of the given kind, staging the key into `KEY_FILE_DIR`.
    pub fn new(kind: CredentialKind, secrets: &HashMap<String, String>) -> Result<Self, Error> {
        Self::new_in(kind, secrets, KEY_FILE_DIR)
    }
    /// Admin credentials.
    pub fn admin(secrets: &HashMap<String, String>) -> Result<Self, Error> {
        Self::new(CredentialKind::Admin, secrets)
    }
    /// Credentials to mount a volume with.
    pub fn for_volume(
        pre_provisioned: bool,
        secrets: &HashMap<String, String>,
    ) -> Result<Self, Error> {
        Self::new(CredentialKind::for_volume(pre_provisioned), secrets)
    }

    /// Build the credentials of the given kind, staging the key into `dir`.
    pub fn new_in(
        kind: CredentialKind,
        secrets: &HashMap<String, String>,
        dir: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        if secrets.is_empty() {
            return EmptySecrets {}.fail();
        }
        let (id_field, key_field) = kind.fields();
        let user_name = match secrets.get(id_field) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => return MissingId { field: id_field }.fail(),
        };
        let key = match secrets.get(key_field) {
            Some(key) if !key.is_empty() => key,
            _ => return MissingKey { field: key_field }.fail(),
        };

        let dir = dir.as_ref();
        let key_file = Self::store_key(key, dir).context(KeyFile { dir })?;
        Ok(Self {
            user_name,
            key_file,
        })
    }

    fn store_key(key: &str, dir: &Path) -> std::io::Result<NamedTempFile> {
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(KEY_FILE_PREFIX)
            .tempfile_in(dir)?;
        file.write_all(key.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// The FastCFS user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }
    /// Path of the staged key file, removed when `self` is dropped.
    pub fn key_file(&self) -> &Path {
        self.key_file.path()
    }
    /// The `-u <user> -k <key file>` arguments shared by the FastCFS tools.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-u".to_string(),
            self.user_name.clone(),
            "-k".to_string(),
            self.key_file().to_string_lossy().into_owned(),
        ]
    }
}
