//! Volume Identifier Codec
//!
//! Every dynamically provisioned volume is handed to the Container Orchestrator as a single
//! opaque handle which packs the FastCFS cluster, the owning user and the pool volume name:
//!
//! `<len>-<cluster_id>-<len>-<owner>-<len>-<volume_name>`
//!
//! where each `<len>` is the byte length of the field that follows, as four lowercase hex
//! digits. As the lengths are explicit, fields may themselves contain the separator.
//! A handle which does not decode is not one of ours, and callers fall back to treating it as
//! the name of a statically provisioned volume.
use snafu::{ensure, OptionExt, Snafu};
use std::{fmt, str::FromStr};

/// Largest handle the CO is guaranteed to accept.
pub const MAX_VOLUME_ID_LEN: usize = 128;
/// Width of the hex length prefix of each field.
const LEN_PREFIX: usize = 4;
const SEPARATOR: char = '-';
/// Three length prefixes and the five separators which join the six tokens.
const ENCODING_OVERHEAD: usize = 3 * LEN_PREFIX + 5;

/// Volume identifier codec errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "Volume id encoding length {} overflows the maximum of {}",
        len,
        MAX_VOLUME_ID_LEN
    ))]
    LengthOverflow { len: usize },
    #[snafu(display("Volume id '{}' is truncated at offset {}", id, offset))]
    Truncated { id: String, offset: usize },
    #[snafu(display("Volume id '{}' has an invalid length prefix at offset {}", id, offset))]
    InvalidLength { id: String, offset: usize },
    #[snafu(display("Volume id '{}' is missing a separator at offset {}", id, offset))]
    MissingSeparator { id: String, offset: usize },
    #[snafu(display("Volume id '{}' has unexpected data from offset {}", id, offset))]
    TrailingData { id: String, offset: usize },
}

/// The decoded form of a compound volume handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeIdentifier {
    cluster_id: String,
    owner: String,
    volume_name: String,
}

impl VolumeIdentifier {
    /// Create a new identifier from its components.
    pub fn new(
        cluster_id: impl Into<String>,
        owner: impl Into<String>,
        volume_name: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            owner: owner.into(),
            volume_name: volume_name.into(),
        }
    }
    /// The FastCFS cluster which hosts the volume.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
    /// The user which created the volume.
    pub fn owner(&self) -> &str {
        &self.owner
    }
    /// The pool volume name.
    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }
    /// Length of the encoded handle.
    pub fn encoded_len(&self) -> usize {
        ENCODING_OVERHEAD + self.cluster_id.len() + self.owner.len() + self.volume_name.len()
    }

    /// Encode into the compound handle.
    /// Fails if the handle would be longer than `MAX_VOLUME_ID_LEN`, which also keeps every
    /// field length within the 16 bits of its prefix.
    pub fn compose(&self) -> Result<String, Error> {
        let len = self.encoded_len();
        ensure!(len <= MAX_VOLUME_ID_LEN, LengthOverflow { len });

        let mut id = String::with_capacity(len);
        for (index, field) in self.fields().into_iter().enumerate() {
            if index > 0 {
                id.push(SEPARATOR);
            }
            id.push_str(&format!("{:04x}{SEPARATOR}{field}", field.len()));
        }
        Ok(id)
    }

    /// Decode a compound handle.
    /// Any deviation from the layout is an error, including data past the last field.
    pub fn decompose(id: &str) -> Result<Self, Error> {
        let mut cursor = Cursor { id, offset: 0 };
        let cluster_id = cursor.next_field()?;
        cursor.separator()?;
        let owner = cursor.next_field()?;
        cursor.separator()?;
        let volume_name = cursor.next_field()?;
        ensure!(
            cursor.offset == id.len(),
            TrailingData {
                id,
                offset: cursor.offset
            }
        );
        Ok(Self::new(cluster_id, owner, volume_name))
    }

    fn fields(&self) -> [&str; 3] {
        [&self.cluster_id, &self.owner, &self.volume_name]
    }
}

impl FromStr for VolumeIdentifier {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::decompose(id)
    }
}

impl fmt::Display for VolumeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_id, self.owner, self.volume_name)
    }
}

/// Walks a handle field by field.
struct Cursor<'a> {
    id: &'a str,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a str, Error> {
        let start = self.offset;
        let slice = start
            .checked_add(len)
            .and_then(|end| self.id.get(start..end))
            .context(Truncated {
                id: self.id,
                offset: start,
            })?;
        self.offset += len;
        Ok(slice)
    }

    fn separator(&mut self) -> Result<(), Error> {
        let offset = self.offset;
        match self.take(1) {
            Ok(sep) if sep.starts_with(SEPARATOR) => Ok(()),
            _ => MissingSeparator {
                id: self.id,
                offset,
            }
            .fail(),
        }
    }

    fn next_field(&mut self) -> Result<&'a str, Error> {
        let offset = self.offset;
        let prefix = self.take(LEN_PREFIX)?;
        // from_str_radix tolerates a leading sign, the prefix must be pure hex.
        ensure!(
            prefix.bytes().all(|b| b.is_ascii_hexdigit()),
            InvalidLength { id: self.id, offset }
        );
        let len = u16::from_str_radix(prefix, 16)
            .ok()
            .context(InvalidLength { id: self.id, offset })?;
        self.separator()?;
        self.take(len as usize)
    }
}
