//! Tap devices: one host-visible virtual interface per forwarding-
//! element port.
//!
//! Frames the device punts to the controller are written to the port's
//! tap so kernel protocol stacks and snoopers see them; frames the
//! kernel emits on the tap are read back and injected into the device
//! pipeline. Open failures are not fatal: the owning projector retries
//! on a fixed timer, since /dev/net/tun may appear only after module
//! load.

use thiserror::Error;

/// Tap device syscall failures. Fatal for the one tap (which gets a
/// timed reopen), never for the process.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to open tap {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tap ioctl failed on {name}: {source}")]
    Ioctl {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tap I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tap operations.
pub type Result<T> = std::result::Result<T, TapError>;

#[cfg(target_os = "linux")]
mod linux {
    use super::{Result, TapError};
    use std::os::fd::{AsRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, trace};

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
    const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

    fn ifreq_for(name: &str) -> Result<libc::ifreq> {
        // ifr_name is IFNAMSIZ (16) bytes including the terminator.
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= 16 {
            return Err(TapError::Open {
                name: name.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "device name must be 1-15 bytes",
                ),
            });
        }
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(ifr)
    }

    /// One open tap device.
    pub struct TapDevice {
        name: String,
        fd: AsyncFd<OwnedFd>,
    }

    impl TapDevice {
        /// Opens (creating if needed) the named tap in no-packet-info
        /// mode and switches it to non-blocking for async reads.
        pub fn open(name: &str) -> Result<Self> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/net/tun")
                .map_err(|source| TapError::Open {
                    name: name.to_string(),
                    source,
                })?;

            let mut ifr = ifreq_for(name)?;
            ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;

            let raw = file.as_raw_fd();
            unsafe {
                if libc::ioctl(raw, TUNSETIFF, &ifr) < 0 {
                    return Err(TapError::Ioctl {
                        name: name.to_string(),
                        source: std::io::Error::last_os_error(),
                    });
                }
                let flags = libc::fcntl(raw, libc::F_GETFL);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(TapError::Ioctl {
                        name: name.to_string(),
                        source: std::io::Error::last_os_error(),
                    });
                }
            }

            let fd = AsyncFd::new(OwnedFd::from(file)).map_err(TapError::Io)?;

            debug!(name, "opened tap device");
            Ok(Self {
                name: name.to_string(),
                fd,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Writes one frame to the kernel side of the tap.
        pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
            let raw = self.fd.as_raw_fd();
            let written =
                unsafe { libc::write(raw, frame.as_ptr() as *const libc::c_void, frame.len()) };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                // A full tap queue drops the single frame.
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    trace!(name = %self.name, "tap queue full, dropping frame");
                    return Ok(());
                }
                return Err(TapError::Io(err));
            }
            Ok(())
        }

        /// Reads one frame from the tap, yielding to the runtime until
        /// one is available. Returns the frame length.
        pub async fn recv_frame(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.readable().await.map_err(TapError::Io)?;

                match guard.try_io(|inner| {
                    let raw = inner.as_raw_fd();
                    let n = unsafe {
                        libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(Ok(n)) => return Ok(n),
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        guard.clear_ready();
                        continue;
                    }
                    Ok(Err(e)) => return Err(TapError::Io(e)),
                    Err(_would_block) => continue,
                }
            }
        }

        /// Sets the kernel-visible link state of the tap.
        pub fn set_up(&self, up: bool) -> Result<()> {
            use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

            let ctrl = socket(
                AddressFamily::Inet,
                SockType::Datagram,
                SockFlag::empty(),
                Some(SockProtocol::Udp),
            )
            .map_err(|e| TapError::Ioctl {
                name: self.name.clone(),
                source: std::io::Error::from(e),
            })?;

            let mut ifr = ifreq_for(&self.name)?;
            let raw = ctrl.as_raw_fd();
            unsafe {
                if libc::ioctl(raw, SIOCGIFFLAGS, &mut ifr) < 0 {
                    return Err(TapError::Ioctl {
                        name: self.name.clone(),
                        source: std::io::Error::last_os_error(),
                    });
                }
                if up {
                    ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
                } else {
                    ifr.ifr_ifru.ifru_flags &= !(libc::IFF_UP as libc::c_short);
                }
                if libc::ioctl(raw, SIOCSIFFLAGS, &ifr) < 0 {
                    return Err(TapError::Ioctl {
                        name: self.name.clone(),
                        source: std::io::Error::last_os_error(),
                    });
                }
            }

            debug!(name = %self.name, up, "set tap link state");
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::TapDevice;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::Result;

    pub struct TapDevice {
        name: String,
    }

    impl TapDevice {
        pub fn open(name: &str) -> Result<Self> {
            Ok(Self {
                name: name.to_string(),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn send_frame(&self, _frame: &[u8]) -> Result<()> {
            Ok(())
        }

        pub async fn recv_frame(&self, _buf: &mut [u8]) -> Result<usize> {
            // In mock, just sleep to prevent busy-loop in tests
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            Ok(0)
        }

        pub fn set_up(&self, _up: bool) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::TapDevice;
