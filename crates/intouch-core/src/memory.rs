//! Cached image of the spa memory
//!
//! The image is a fixed-size buffer with a parallel "known" map. Only updates
//! pushed by the device mutate it; [`MemoryImage::apply`] reports exactly the
//! byte runs whose value changed (or became known for the first time).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Width of a memory read or of a reported change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Width {
    U8,
    U16,
    Range(u16),
}

impl Width {
    /// Number of bytes covered
    pub fn len(&self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::Range(len) => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Narrowest width describing `len` bytes
    pub fn for_len(len: usize) -> Width {
        match len {
            1 => Width::U8,
            2 => Width::U16,
            n => Width::Range(n.min(u16::MAX as usize) as u16),
        }
    }
}

/// One confirmed change of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub address: u16,
    pub width: Width,
    pub data: Bytes,
}

/// Last-known spa memory
#[derive(Debug, Clone)]
pub struct MemoryImage {
    data: Vec<u8>,
    known: Vec<bool>,
}

impl MemoryImage {
    /// Create an image of `size` bytes with nothing known yet
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            known: vec![false; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes observed so far
    pub fn known_len(&self) -> usize {
        self.known.iter().filter(|known| **known).count()
    }

    /// True once every byte has been observed
    pub fn is_complete(&self) -> bool {
        self.known.iter().all(|known| *known)
    }

    pub fn is_known(&self, address: u16) -> bool {
        self.known.get(address as usize).copied().unwrap_or(false)
    }

    /// Apply a device update at `address`.
    ///
    /// Returns the changed runs in address order; an update equal to the
    /// cached bytes returns an empty list. Updates running past the end of
    /// the image are rejected and leave it untouched.
    pub fn apply(&mut self, address: u16, data: &[u8]) -> Result<Vec<StateChange>> {
        let start = address as usize;
        let end = start + data.len();
        if end > self.data.len() {
            return Err(Error::OutOfBounds {
                address,
                len: data.len(),
                size: self.data.len(),
            });
        }

        let mut changes = Vec::new();
        let mut run: Option<usize> = None;

        for (offset, &byte) in data.iter().enumerate() {
            let index = start + offset;
            let changed = !self.known[index] || self.data[index] != byte;
            self.data[index] = byte;
            self.known[index] = true;

            match (changed, run) {
                (true, None) => run = Some(index),
                (false, Some(run_start)) => {
                    changes.push(self.change(run_start, index));
                    run = None;
                }
                _ => {}
            }
        }
        if let Some(run_start) = run {
            changes.push(self.change(run_start, end));
        }

        Ok(changes)
    }

    /// Read `width` bytes at `address`; `None` if any of them was never
    /// observed or the read runs past the image.
    pub fn read(&self, address: u16, width: Width) -> Option<&[u8]> {
        let start = address as usize;
        let end = start + width.len();
        if end > self.data.len() || !self.known[start..end].iter().all(|known| *known) {
            return None;
        }
        Some(&self.data[start..end])
    }

    /// Big-endian u16 at `address`
    pub fn read_u16(&self, address: u16) -> Option<u16> {
        self.read(address, Width::U16)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Forget everything observed so far
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.known.fill(false);
    }

    fn change(&self, start: usize, end: usize) -> StateChange {
        StateChange {
            address: start as u16,
            width: Width::for_len(end - start),
            data: Bytes::copy_from_slice(&self.data[start..end]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_a_change() {
        let mut image = MemoryImage::new(8);
        let changes = image.apply(2, &[0, 0]).unwrap();
        assert_eq!(
            changes,
            vec![StateChange {
                address: 2,
                width: Width::U16,
                data: Bytes::from_static(&[0, 0]),
            }]
        );
    }

    #[test]
    fn test_split_runs() {
        let mut image = MemoryImage::new(8);
        image.apply(0, &[1, 2, 3, 4]).unwrap();
        let changes = image.apply(0, &[9, 2, 3, 8]).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].address, 0);
        assert_eq!(changes[0].width, Width::U8);
        assert_eq!(changes[1].address, 3);
        assert_eq!(changes[1].data.as_ref(), &[8]);
    }

    #[test]
    fn test_read_unknown() {
        let mut image = MemoryImage::new(8);
        image.apply(0, &[1]).unwrap();
        assert_eq!(image.read(0, Width::U8), Some(&[1u8][..]));
        assert_eq!(image.read(0, Width::U16), None);
        assert_eq!(image.read(7, Width::U16), None);
    }

    #[test]
    fn test_width_serde() {
        assert_eq!(serde_json::to_string(&Width::U16).unwrap(), "\"u16\"");
        assert_eq!(
            serde_json::from_str::<Width>("{\"range\":4}").unwrap(),
            Width::Range(4)
        );
    }
}
