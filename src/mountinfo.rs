//! `/proc/self/mountinfo` parsing
//!
//! Line format (proc(5)):
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Bind mounts of the same filesystem share the device number (3) and the
//! root (4), which is how references to a shared mount are counted.

use crate::error::{VolumeError, VolumeResult};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// One mount table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    /// `major:minor` of the backing device
    pub major_minor: String,
    /// Root of the mount within its filesystem
    pub root: PathBuf,
    pub mount_point: PathBuf,
    pub options: Vec<String>,
    pub fs_type: String,
    pub source: String,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|opt| opt == "ro")
    }

    fn same_origin(&self, other: &MountEntry) -> bool {
        self.major_minor == other.major_minor && self.root == other.root
    }
}

/// Snapshot of the mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read the calling process's mount table.
    pub fn load() -> VolumeResult<Self> {
        Self::load_from(Path::new(PROC_MOUNTINFO))
    }

    pub fn load_from(path: &Path) -> VolumeResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| VolumeError::probe(path, e))?;
        Self::parse(&contents).map_err(|reason| VolumeError::probe(path, reason))
    }

    /// Parse mountinfo text; the error names the offending line.
    pub fn parse(input: &str) -> Result<Self, String> {
        let entries = input
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MountTable { entries })
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// The topmost mount at `path`, if any.
    ///
    /// Later rows shadow earlier ones when several mounts stack on one path.
    /// The kernel records mount points with symlinks resolved, so an existing
    /// `path` is canonicalized before the lookup.
    pub fn find(&self, path: &Path) -> Option<&MountEntry> {
        let resolved = resolve(path);
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.mount_point == path || entry.mount_point == resolved.as_ref())
    }

    pub fn is_mount_point(&self, path: &Path) -> bool {
        self.find(path).is_some()
    }

    /// Every other mount point exposing the same filesystem view as `path`.
    pub fn refs_of(&self, path: &Path) -> Vec<PathBuf> {
        let Some(origin) = self.find(path) else {
            return Vec::new();
        };

        let mut refs: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|entry| entry.mount_point != origin.mount_point && entry.same_origin(origin))
            .map(|entry| entry.mount_point.clone())
            .collect();
        refs.dedup();
        refs
    }

    /// Whether any mount is backed by the given source device.
    ///
    /// Sources are recorded as given to mount(2), often a udev link, so both
    /// sides are compared by the node they resolve to.
    pub fn has_source(&self, source: &Path) -> bool {
        let wanted = resolve(source);
        self.entries.iter().any(|entry| {
            let recorded = Path::new(&entry.source);
            // Pseudo sources like `proc` or `tmpfs` are not paths
            recorded.is_absolute()
                && (recorded == source || resolve(recorded).as_ref() == wanted.as_ref())
        })
    }
}

fn resolve(path: &Path) -> Cow<'_, Path> {
    match fs::canonicalize(path) {
        Ok(resolved) => Cow::Owned(resolved),
        Err(_) => Cow::Borrowed(path),
    }
}

fn parse_line(line: &str) -> Result<MountEntry, String> {
    let invalid = || format!("invalid mountinfo line: {}", line);

    let (left, right) = line.split_once(" - ").ok_or_else(invalid)?;

    let mut fields = left.split_whitespace();
    let mount_id = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    let parent_id = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
    let major_minor = fields.next().ok_or_else(invalid)?.to_string();
    let root = fields.next().ok_or_else(invalid)?;
    let mount_point = fields.next().ok_or_else(invalid)?;
    let options = fields.next().ok_or_else(invalid)?;

    let mut right_fields = right.split_whitespace();
    let fs_type = right_fields.next().ok_or_else(invalid)?.to_string();
    let source = right_fields.next().map(unescape_mount_field).unwrap_or_default();

    Ok(MountEntry {
        mount_id,
        parent_id,
        major_minor,
        root: PathBuf::from(unescape_mount_field(root)),
        mount_point: PathBuf::from(unescape_mount_field(mount_point)),
        options: options.split(',').map(str::to_string).collect(),
        fs_type,
        source,
    })
}

/// Undo the kernel's octal escaping (`\040` for space, `\011` tab, `\012`
/// newline, `\134` backslash).
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..index + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            if let Ok(num) = u8::from_str_radix(&value[index + 1..index + 4], 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
