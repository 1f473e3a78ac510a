use std::fs::{self, File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt as WindowsFileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::fcntl::{fallocate, FallocateFlags};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

/// Creates the parent directory and an empty target file, discarding stale bytes.
pub fn prepare_target(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(())
}

/// Opens an independent write handle. Never truncates: siblings share the file.
pub fn open_shared(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).write(true).open(path)
}

/// Grows the target to `size` bytes without touching what siblings already wrote.
pub fn preallocate(path: &Path, size: u64) -> io::Result<()> {
    let file = open_shared(path)?;
    if file.metadata()?.len() >= size {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        if size > 0 {
            if let Err(err) = fallocate(
                file.as_raw_fd(),
                FallocateFlags::FALLOC_FL_KEEP_SIZE,
                0,
                size as i64,
            ) {
                if err != Errno::ENOTSUP && err != Errno::EINVAL {
                    return Err(io::Error::from_raw_os_error(err as i32));
                }
            }
        }
    }

    file.set_len(size)
}

#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], position: u64) -> io::Result<()> {
    file.write_all_at(buf, position)
}

#[cfg(windows)]
pub fn write_all_at(file: &File, mut buf: &[u8], mut position: u64) -> io::Result<()> {
    while !buf.is_empty() {
        let written = file.seek_write(buf, position)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write segment data",
            ));
        }
        buf = &buf[written..];
        position += written as u64;
    }
    Ok(())
}
