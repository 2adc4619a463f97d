//! Transport to the kernel driver.
//!
//! The kernel client talks to the daemon over a single bidirectional
//! character device carrying the same frames as the peer network. The
//! kernel always initiates; the daemon reads a request frame, dispatches
//! it and writes the reply back. One channel mutex serializes device
//! access; the read loop polls for readability before taking it, so reply
//! writers never wait behind a blocked read.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use parking_lot::Mutex;

use crate::codec::read_frame;

/// Poll granularity of the read loop; bounds shutdown latency.
const POLL_INTERVAL_MS: i32 = 100;

/// The open kernel device.
pub struct KernelChannel {
    device: Mutex<File>,
    path: PathBuf,
}

impl KernelChannel {
    pub fn open(path: &Path) -> io::Result<KernelChannel> {
        let device = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(KernelChannel {
            device: Mutex::new(device),
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one reply frame to the kernel.
    pub fn write_reply(&self, frame: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let device = self.device.lock();
        (&*device).write_all(frame)
    }

    fn poll_readable(&self) -> io::Result<bool> {
        let fd = self.device.lock().as_raw_fd();
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
            return match rc {
                0 => Ok(false),
                1 => {
                    if pollfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                        Err(io::Error::from_raw_os_error(libc::ENODEV))
                    } else {
                        Ok(true)
                    }
                }
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    Err(err)
                }
            };
        }
    }

    /// Read request frames and hand them to `on_frame` until the device
    /// goes away or `running` clears. Returns cleanly on shutdown and on
    /// device removal.
    pub fn run(&self, running: &AtomicBool, on_frame: &mut dyn FnMut(Vec<u8>)) -> io::Result<()> {
        info!("kernel channel on {}", self.path.display());
        while running.load(Ordering::Acquire) {
            match self.poll_readable() {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                    info!("kernel device detached");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }

            let frame = {
                let device = self.device.lock();
                read_frame(&mut &*device)
            };
            match frame {
                Ok(Some(frame)) => on_frame(frame),
                Ok(None) => {
                    info!("kernel channel closed");
                    return Ok(());
                }
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    Some(libc::ENODEV) => {
                        info!("kernel device detached");
                        return Ok(());
                    }
                    _ => {
                        warn!("kernel channel read failed: {err}");
                        return Err(err);
                    }
                },
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for KernelChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelChannel")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataCoder;
    use nix::sys::stat::Mode;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn frame_with(value: u32) -> Vec<u8> {
        let mut dc = DataCoder::new();
        dc.start_encoding();
        dc.encode_u32(value).unwrap();
        dc.finish_encoding().to_vec()
    }

    #[test]
    fn receives_frames_from_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfs-dev");
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        let channel = KernelChannel::open(&path).unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                use std::io::Write;
                let mut fifo = std::fs::OpenOptions::new().write(true).open(path).unwrap();
                fifo.write_all(&frame_with(7)).unwrap();
                fifo.write_all(&frame_with(8)).unwrap();
            })
        };

        let mut seen = Vec::new();
        {
            let running = running.clone();
            let mut on_frame = |frame: Vec<u8>| {
                let mut r = crate::codec::FrameReader::new(&frame).unwrap();
                seen.push(r.read_u32().unwrap());
                if seen.len() == 2 {
                    running.store(false, Ordering::Release);
                }
            };
            channel.run(&running, &mut on_frame).unwrap();
        }
        assert_eq!(seen, vec![7, 8]);
        writer.join().unwrap();
    }

    #[test]
    fn replies_are_written_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfs-dev");
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        let channel = KernelChannel::open(&path).unwrap();

        channel.write_reply(&frame_with(99)).unwrap();
        // The channel holds the device read-write, so the frame can be read
        // back out of the FIFO.
        let mut reader = std::fs::OpenOptions::new().read(true).open(&path).unwrap();
        let frame = read_frame(&mut reader).unwrap().unwrap();
        let mut r = crate::codec::FrameReader::new(&frame).unwrap();
        assert_eq!(r.read_u32().unwrap(), 99);
    }
}
