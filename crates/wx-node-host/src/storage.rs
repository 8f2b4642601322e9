use std::fs;
use std::path::{Path, PathBuf};

use wx_node::hal::{NvError, NvMemory, RetainedRam};

/// Size of the emulated parameter EEPROM (16 pages of 32 bytes covers
/// every defined block, rounded up).
const EEPROM_SIZE: usize = 512;

/// File-backed parameter EEPROM. The whole image lives in memory and is
/// written through on every page write, so a crash at any point leaves a
/// consistent file behind.
pub struct FileNv {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileNv {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut image = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![0xFF; EEPROM_SIZE],
            Err(e) => return Err(e),
        };
        image.resize(EEPROM_SIZE, 0xFF);

        Ok(FileNv {
            path: path.to_path_buf(),
            image,
        })
    }

    fn persist(&mut self) -> Result<(), NvError> {
        fs::write(&self.path, &self.image).map_err(|e| {
            log::error!("EEPROM image write failed: {}", e);
            NvError::TooManyRetries
        })
    }

    fn range(&self, addr: u16, len: usize) -> Result<std::ops::Range<usize>, NvError> {
        let start = addr as usize;
        let end = start + len;
        if end > self.image.len() {
            return Err(NvError::Nak);
        }
        Ok(start..end)
    }
}

impl NvMemory for FileNv {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), NvError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.image[range]);
        Ok(())
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError> {
        let range = self.range(addr, data.len())?;
        self.image[range].copy_from_slice(data);
        self.persist()
    }

    fn compare(&mut self, addr: u16, data: &[u8]) -> Result<(), NvError> {
        let range = self.range(addr, data.len())?;
        if &self.image[range] == data {
            Ok(())
        } else {
            Err(NvError::CompareMismatch)
        }
    }
}

/// File-backed battery-backed RAM image.
pub struct FileRetainedRam {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileRetainedRam {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let image = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(FileRetainedRam {
            path: path.to_path_buf(),
            image,
        })
    }
}

impl RetainedRam for FileRetainedRam {
    fn load(&mut self, buf: &mut [u8]) {
        if self.image.len() == buf.len() {
            buf.copy_from_slice(&self.image);
        } else {
            // Never written (or a layout change): reads as trashed, which
            // the validation layer turns into a clean slate.
            buf.fill(0);
        }
    }

    fn store(&mut self, data: &[u8]) {
        self.image = data.to_vec();
        if let Err(e) = fs::write(&self.path, &self.image) {
            log::error!("retained image write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn eeprom_image_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eeprom.bin");

        let mut nv = FileNv::open(&path).unwrap();
        nv.write(32, b"\x55\xAA-block-").unwrap();

        let mut nv = FileNv::open(&path).unwrap();
        let mut buf = [0u8; 9];
        nv.read(32, &mut buf).unwrap();
        assert_eq!(&buf, b"\x55\xAA-block-");
    }

    #[test]
    fn out_of_range_access_is_a_bus_error() {
        let dir = tempdir().unwrap();
        let mut nv = FileNv::open(&dir.path().join("eeprom.bin")).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(nv.read(u16::MAX, &mut buf), Err(NvError::Nak));
    }

    #[test]
    fn compare_reports_differences() {
        let dir = tempdir().unwrap();
        let mut nv = FileNv::open(&dir.path().join("eeprom.bin")).unwrap();

        nv.write(0, b"abcd").unwrap();
        assert_eq!(nv.compare(0, b"abcd"), Ok(()));
        assert_eq!(nv.compare(0, b"abcx"), Err(NvError::CompareMismatch));
    }

    #[test]
    fn retained_image_round_trips_and_detects_size_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("retain.bin");

        let mut ram = FileRetainedRam::open(&path).unwrap();
        ram.store(&[7u8; 82]);

        let mut ram = FileRetainedRam::open(&path).unwrap();
        let mut buf = [0u8; 82];
        ram.load(&mut buf);
        assert_eq!(buf, [7u8; 82]);

        // A different expected size reads as cleared.
        let mut small = [1u8; 10];
        ram.load(&mut small);
        assert_eq!(small, [0u8; 10]);
    }
}
