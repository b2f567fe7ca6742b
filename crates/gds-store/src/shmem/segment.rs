//! Shared-memory segments
//!
//! A segment is a file-backed `MAP_SHARED` mapping. The creating process
//! owns it: it sizes the backing file, maps it at an address chosen from a
//! free hole and removes the file on drop. Other processes attach at the
//! owner's address using the [`ConnectionInfo`] it hands out; a mapping at
//! any other address is rejected because the data inside the segment holds
//! absolute pointers.

use gds_common::{Error, Result, Value, WireBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
const MAP_PLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_PLACE: libc::c_int = 0;

/// What a segment holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    Job,
    Session,
    Modex,
}

impl SegmentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Session => "session",
            Self::Modex => "modex",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an attacher needs to map a segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Namespace (or session id) the segment belongs to
    pub nsid: String,
    pub kind: SegmentKind,
    pub path: PathBuf,
    pub size: usize,
    /// Address the owner mapped the segment at
    pub base: usize,
}

impl ConnectionInfo {
    /// Pack into an opaque byte object
    pub fn to_value(&self) -> Result<Value> {
        let mut buf = WireBuffer::new();
        buf.pack(self)?;
        Ok(Value::Bytes(buf.unread().to_vec()))
    }

    /// Unpack from the byte object produced by [`ConnectionInfo::to_value`]
    pub fn from_value(value: &Value) -> Result<Self> {
        let bytes = value
            .as_bytes()
            .ok_or_else(|| Error::type_mismatch("connection info must be a byte object"))?;
        WireBuffer::from_bytes(bytes).unpack()
    }
}

/// Backing file name `<prefix>-gds-shmem.<hostname>-<nsid>.<kind>.<pid>`
#[must_use]
pub fn backing_path(
    dir: &Path,
    prefix: &str,
    hostname: &str,
    nsid: &str,
    kind: SegmentKind,
    pid: u32,
) -> PathBuf {
    dir.join(format!("{prefix}-gds-shmem.{hostname}-{nsid}.{kind}.{pid}"))
}

/// Round up to a whole number of pages
#[must_use]
pub fn page_round(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).ok().filter(|&p| p > 0).unwrap_or(4096)
}

fn map(file: &File, size: usize, at: Option<usize>, writable: bool) -> Result<*mut u8> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let (hint, flags) = match at {
        Some(addr) => (addr as *mut libc::c_void, libc::MAP_SHARED | MAP_PLACE),
        None => (std::ptr::null_mut(), libc::MAP_SHARED),
    };
    let ptr = unsafe { libc::mmap(hint, size, prot, flags, file.as_raw_fd(), 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::segment(format!(
            "mmap of {size} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    if let Some(addr) = at
        && ptr as usize != addr
    {
        unsafe {
            libc::munmap(ptr, size);
        }
        return Err(Error::AddressMismatch {
            requested: addr,
            actual: ptr as usize,
        });
    }
    Ok(ptr.cast::<u8>())
}

/// One mapped segment
pub struct Segment {
    base: *mut u8,
    size: usize,
    path: PathBuf,
    nsid: String,
    kind: SegmentKind,
    owner: bool,
    _file: File,
}

impl Segment {
    /// Create the backing file and map it, at `at` when given
    pub fn create(
        path: &Path,
        size: usize,
        at: Option<usize>,
        nsid: &str,
        kind: SegmentKind,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::bad_param("segment size must be > 0"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::segment(format!("failed to create {}: {e}", path.display())))?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let base = match map(&file, size, at, true) {
            Ok(base) => base,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };
        debug!(
            "created {} segment {} at {:#x} ({} bytes)",
            kind,
            path.display(),
            base as usize,
            size
        );
        Ok(Self {
            base,
            size,
            path: path.to_path_buf(),
            nsid: nsid.to_string(),
            kind,
            owner: true,
            _file: file,
        })
    }

    /// Map a segment read-only at the owner's address
    pub fn attach(info: &ConnectionInfo) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(&info.path)
            .map_err(|e| {
                Error::segment(format!("failed to open {}: {e}", info.path.display()))
            })?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::segment("segment too large"))?;
        if len < info.size {
            return Err(Error::segment(format!(
                "{} holds {len} bytes, expected {}",
                info.path.display(),
                info.size
            )));
        }
        let base = map(&file, info.size, Some(info.base), false)?;
        debug!(
            "attached {} segment {} at {:#x}",
            info.kind,
            info.path.display(),
            info.base
        );
        Ok(Self {
            base,
            size: info.size,
            path: info.path.clone(),
            nsid: info.nsid.clone(),
            kind: info.kind,
            owner: false,
            _file: file,
        })
    }

    /// Hand the backing file to another user and/or group
    pub fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        nix::unistd::chown(
            &self.path,
            uid.map(nix::unistd::Uid::from_raw),
            gid.map(nix::unistd::Gid::from_raw),
        )
        .map_err(|e| Error::segment(format!("chown {} failed: {e}", self.path.display())))
    }

    /// Change the permission bits of the backing file
    pub fn set_mode(&self, mode: u32) -> Result<()> {
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub(crate) const fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn kind(&self) -> SegmentKind {
        self.kind
    }

    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    /// Description handed to attachers
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            nsid: self.nsid.clone(),
            kind: self.kind,
            path: self.path.clone(),
            size: self.size,
            base: self.base(),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.size);
        }
        if self.owner
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

// The mapping stays valid for the life of the segment; only the owner writes.
unsafe impl Send for Segment {}
