//! Output file for a firmware download, with an offset file beside it so an
//! interrupted run can pick up where it stopped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub struct FirmwareSink {
    path: PathBuf,
    offset_path: PathBuf,
    file: File,
    /// Error reported by the engine since the last restart.
    pub last_error: Option<String>,
    pub fatal: bool,
}

impl FirmwareSink {
    /// Open `path` for writing. Returns the sink and the offset to resume from.
    pub fn open(path: &Path) -> anyhow::Result<(Self, u64)> {
        let offset_path = offset_path_for(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let on_disk = file.metadata()?.len();
        let resume = match read_offset(&offset_path) {
            Some(offset) if offset <= on_disk => offset,
            Some(offset) => {
                warn!(offset, on_disk, "offset file ahead of output, starting over");
                0
            }
            None => 0,
        };
        if resume == 0 {
            file.set_len(0)?;
        } else {
            info!(offset = resume, path = %path.display(), "resuming partial download");
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                offset_path,
                file,
                last_error: None,
                fatal: false,
            },
            resume,
        ))
    }

    /// Write a fragment at its offset and record the new resume point.
    pub fn write_fragment(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        let next = offset + data.len() as u64;
        fs::write(&self.offset_path, next.to_string())
            .with_context(|| format!("writing {}", self.offset_path.display()))?;
        Ok(())
    }

    /// Trim to `firmware_size` and flush to stable storage.
    pub fn finish(&mut self, firmware_size: u64) -> anyhow::Result<()> {
        self.file.set_len(firmware_size)?;
        self.file
            .sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(())
    }

    /// SHA-256 of the output file, hex encoded.
    pub fn sha256(&mut self) -> anyhow::Result<String> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut hasher = Sha256::new();
        io::copy(&mut self.file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Error recorded since the last restart and whether it was fatal. Both
    /// are cleared.
    pub fn take_failure(&mut self) -> (String, bool) {
        (
            self.last_error.take().unwrap_or_default(),
            std::mem::take(&mut self.fatal),
        )
    }

    /// Forget the resume point.
    pub fn clear_offset(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.offset_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn offset_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".offset");
    PathBuf::from(name)
}

fn read_offset(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    match raw.trim().parse() {
        Ok(offset) => Some(offset),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable offset file");
            None
        }
    }
}
