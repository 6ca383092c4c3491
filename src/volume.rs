//! Voxel volumes allocated slice by slice with partial population tracking

use crate::error::{Result, VolumeError};
use crate::partial::ImageRanges;
use crate::types::{Box3, PixelFormat};
use crate::utils::format_bytes;
use parking_lot::RwLock;
use std::ops::Range;
use std::sync::Arc;

/// Volume handle shared between a loader and its readers
pub type SharedVolume = Arc<RwLock<VoxelVolume>>;

/// Fixed-size bitset recording which slices have been written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceSet {
    words: Vec<u64>,
    len: usize,
}

impl SliceSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark `index`; returns true when it was not set before
    pub fn insert(&mut self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of marked entries
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }
}

/// A 3-D grid of voxels stored as one buffer per z-slice.
///
/// Slices start zero-filled but unpopulated; reading a voxel of an
/// unpopulated slice is an error. The volume provides no locking: a single
/// owner writes, everyone else reads through a [`SharedVolume`].
#[derive(Debug, Clone)]
pub struct VoxelVolume {
    size: [usize; 3],
    format: PixelFormat,
    slices: Vec<Vec<u8>>,
    populated: SliceSet,
    min: i32,
    max: i32,
    version: u64,
}

impl Default for VoxelVolume {
    fn default() -> Self {
        Self {
            size: [0; 3],
            format: PixelFormat::UInt8,
            slices: Vec::new(),
            populated: SliceSet::default(),
            min: PixelFormat::UInt8.max_level(),
            max: PixelFormat::UInt8.min_level(),
            version: 0,
        }
    }
}

impl VoxelVolume {
    /// Create a volume of the given size with every slice unpopulated
    pub fn new(x: usize, y: usize, z: usize, format: PixelFormat) -> Result<Self> {
        let mut volume = Self::default();
        volume.set_dimension(x, y, z, format)?;
        Ok(volume)
    }

    /// Build a fully populated binary volume from a one-byte-per-voxel mask
    pub fn from_mask(size: [usize; 3], mask: &[u8]) -> Result<Self> {
        let [x, y, z] = size;
        if mask.len() != x * y * z {
            return Err(VolumeError::InvalidDimensions(format!(
                "Mask holds {} voxels, expected {}",
                mask.len(),
                x * y * z
            )));
        }
        let mut volume = Self::new(x, y, z, PixelFormat::Binary)?;
        let plane = x * y;
        for (zi, chunk) in mask.chunks(plane.max(1)).enumerate().take(z) {
            let mut buf = vec![0u8; PixelFormat::Binary.slice_byte_len(plane)];
            for (i, &v) in chunk.iter().enumerate() {
                write_raw(PixelFormat::Binary, &mut buf, i, v as i32);
            }
            volume.insert_single_image(zi, &buf)?;
        }
        Ok(volume)
    }

    /// Allocate `z` empty slices of `x * y` voxels, replacing all state
    pub fn set_dimension(
        &mut self,
        x: usize,
        y: usize,
        z: usize,
        format: PixelFormat,
    ) -> Result<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(VolumeError::InvalidDimensions(format!(
                "Volume dimensions must be positive, got {}x{}x{}",
                x, y, z
            )));
        }
        let slice_len = format.slice_byte_len(x * y);
        self.size = [x, y, z];
        self.format = format;
        self.slices = (0..z).map(|_| vec![0u8; slice_len]).collect();
        self.populated = SliceSet::new(z);
        self.min = format.max_level();
        self.max = format.min_level();
        self.version += 1;
        Ok(())
    }

    /// Dimensions `(x, y, z)`
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Counter bumped on every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Smallest value written so far, or the format maximum if none
    pub fn min(&self) -> i32 {
        self.min
    }

    /// Largest value written so far, or the format minimum if none
    pub fn max(&self) -> i32 {
        self.max
    }

    /// Observed `(min, max)`, `None` before any write
    pub fn value_range(&self) -> Option<(i32, i32)> {
        (self.min <= self.max).then_some((self.min, self.max))
    }

    /// Total bytes held by slice buffers
    pub fn byte_size(&self) -> usize {
        self.slices.iter().map(Vec::len).sum()
    }

    fn slice_voxels(&self) -> usize {
        self.size[0] * self.size[1]
    }

    fn check_z(&self, z: usize) -> Result<()> {
        if z >= self.size[2] {
            return Err(VolumeError::OutOfBounds(format!(
                "Slice {} outside depth {}",
                z, self.size[2]
            )));
        }
        Ok(())
    }

    fn check_point(&self, x: usize, y: usize, z: usize) -> Result<()> {
        if x >= self.size[0] || y >= self.size[1] || z >= self.size[2] {
            return Err(VolumeError::OutOfBounds(format!(
                "Voxel ({}, {}, {}) outside volume {:?}",
                x, y, z, self.size
            )));
        }
        Ok(())
    }

    fn track(&mut self, value: i32) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Store a whole slice from its raw byte representation
    pub fn insert_single_image(&mut self, z: usize, bytes: &[u8]) -> Result<()> {
        self.check_z(z)?;
        let expected = self.format.slice_byte_len(self.slice_voxels());
        if bytes.len() != expected {
            return Err(VolumeError::InvalidDimensions(format!(
                "Slice {} payload is {} bytes, expected {}",
                z,
                bytes.len(),
                expected
            )));
        }
        self.slices[z].copy_from_slice(bytes);
        if let Some((lo, hi)) = raw_value_range(self.format, &self.slices[z], self.slice_voxels()) {
            self.track(lo);
            self.track(hi);
        }
        self.populated.insert(z);
        self.version += 1;
        Ok(())
    }

    /// Store one voxel; the containing slice becomes populated
    pub fn write_pixel_at(&mut self, value: i32, x: usize, y: usize, z: usize) -> Result<()> {
        self.check_point(x, y, z)?;
        let offset = x + y * self.size[0];
        write_raw(self.format, &mut self.slices[z], offset, value);
        self.track(read_raw(self.format, &self.slices[z], offset));
        self.populated.insert(z);
        self.version += 1;
        Ok(())
    }

    /// Read one voxel of a populated slice
    pub fn get_pixel_at(&self, x: usize, y: usize, z: usize) -> Result<i32> {
        self.check_point(x, y, z)?;
        if !self.populated.contains(z) {
            return Err(VolumeError::NotPopulated { z });
        }
        Ok(read_raw(self.format, &self.slices[z], x + y * self.size[0]))
    }

    /// Raw bytes of a populated slice
    pub fn read_slice(&self, z: usize) -> Result<&[u8]> {
        self.check_z(z)?;
        if !self.populated.contains(z) {
            return Err(VolumeError::NotPopulated { z });
        }
        Ok(&self.slices[z])
    }

    /// Min and max of one populated slice
    pub fn slice_value_range(&self, z: usize) -> Result<(i32, i32)> {
        let slice = self.read_slice(z)?;
        raw_value_range(self.format, slice, self.slice_voxels())
            .ok_or_else(|| VolumeError::InvalidDimensions("Empty slice".to_string()))
    }

    pub fn is_populated(&self, z: usize) -> bool {
        self.populated.contains(z)
    }

    /// Check that every z index in `range` is populated
    pub fn contain_image(&self, range: Range<usize>) -> bool {
        range.end <= self.size[2] && range.clone().all(|z| self.populated.contains(z))
    }

    pub fn is_complete(&self) -> bool {
        !self.populated.is_empty() && self.populated.is_full()
    }

    /// Populated z indices as a compact range set
    pub fn populated_slices(&self) -> ImageRanges {
        (0..self.size[2])
            .filter(|&z| self.populated.contains(z))
            .map(|z| z as u32)
            .collect()
    }

    /// Copy an axis-aligned region of `source` into this volume.
    ///
    /// `region` defaults to the whole source and must lie inside it.
    /// `dest_offset` may be negative; voxels falling outside this volume are
    /// skipped.
    pub fn copy_from(
        &mut self,
        source: &VoxelVolume,
        region: Option<Box3>,
        dest_offset: Option<[i64; 3]>,
    ) -> Result<()> {
        if source.format != self.format {
            return Err(VolumeError::Validation(format!(
                "Cannot copy {} voxels into a {} volume",
                source.format, self.format
            )));
        }
        let region = region.unwrap_or_else(|| Box3::from_size(source.size));
        region.validate()?;
        if !region.is_within(source.size) {
            return Err(VolumeError::OutOfBounds(format!(
                "Copy region {:?} exceeds source {:?}",
                region, source.size
            )));
        }
        let offset = dest_offset.unwrap_or([0; 3]);
        let extent = region.size();

        // Overlap in destination coordinates, per axis
        let mut lo = [0usize; 3];
        let mut hi = [0usize; 3];
        for axis in 0..3 {
            let start = offset[axis].max(0);
            let end = (offset[axis] + extent[axis] as i64).min(self.size[axis] as i64);
            if end <= start {
                return Ok(());
            }
            lo[axis] = start as usize;
            hi[axis] = end as usize;
        }
        let src_of = |axis: usize, d: usize| (d as i64 - offset[axis] + region.min[axis]) as usize;

        for dz in lo[2]..hi[2] {
            let sz = src_of(2, dz);
            if !source.populated.contains(sz) {
                return Err(VolumeError::NotPopulated { z: sz });
            }
        }

        for dz in lo[2]..hi[2] {
            let sz = src_of(2, dz);
            for dy in lo[1]..hi[1] {
                let sy = src_of(1, dy);
                for dx in lo[0]..hi[0] {
                    let sx = src_of(0, dx);
                    let src = sx + sy * source.size[0];
                    let value = read_raw(source.format, &source.slices[sz], src);
                    write_raw(self.format, &mut self.slices[dz], dx + dy * self.size[0], value);
                    self.track(value);
                }
            }
            self.populated.insert(dz);
        }
        self.version += 1;
        Ok(())
    }

    /// Resize to `new_box`, keeping voxels that fall inside it.
    ///
    /// Old voxel `p` sits at `p + origin_shift` and moves to
    /// `p + origin_shift - new_box.min`. Introduced voxels are zero.
    pub fn transform_bounding_box(
        &mut self,
        new_box: Box3,
        origin_shift: Option<[i64; 3]>,
    ) -> Result<()> {
        new_box.validate()?;
        let shift = origin_shift.unwrap_or([0; 3]);
        let [nx, ny, nz] = new_box.size();
        let slice_len = self.format.slice_byte_len(nx * ny);
        let old_of = |axis: usize, n: usize| n as i64 + new_box.min[axis] - shift[axis];
        let inside = |axis: usize, old: i64| old >= 0 && old < self.size[axis] as i64;

        let mut slices = Vec::with_capacity(nz);
        let mut populated = SliceSet::new(nz);
        for z in 0..nz {
            let mut buf = vec![0u8; slice_len];
            let oz = old_of(2, z);
            if !inside(2, oz) {
                populated.insert(z);
            } else if self.populated.contains(oz as usize) {
                let src = &self.slices[oz as usize];
                for y in 0..ny {
                    let oy = old_of(1, y);
                    if !inside(1, oy) {
                        continue;
                    }
                    for x in 0..nx {
                        let ox = old_of(0, x);
                        if inside(0, ox) {
                            let offset = ox as usize + oy as usize * self.size[0];
                            let value = read_raw(self.format, src, offset);
                            write_raw(self.format, &mut buf, x + y * nx, value);
                        }
                    }
                }
                populated.insert(z);
            }
            slices.push(buf);
        }

        self.size = [nx, ny, nz];
        self.slices = slices;
        self.populated = populated;
        self.recompute_value_range();
        self.version += 1;
        Ok(())
    }

    /// Produce a same-size volume in `new_format`, mapping every voxel.
    ///
    /// Unpopulated slices stay unpopulated. Mapped values are not clamped.
    pub fn convert<F>(&self, new_format: PixelFormat, map: F) -> Result<VoxelVolume>
    where
        F: Fn(i32) -> i32,
    {
        let [x, y, z] = self.size;
        let mut out = VoxelVolume::new(x, y, z, new_format)?;
        let voxels = self.slice_voxels();
        for zi in (0..z).filter(|&zi| self.populated.contains(zi)) {
            let mut buf = vec![0u8; new_format.slice_byte_len(voxels)];
            for i in 0..voxels {
                let value = map(read_raw(self.format, &self.slices[zi], i));
                write_raw(new_format, &mut buf, i, value);
            }
            out.insert_single_image(zi, &buf)?;
        }
        Ok(out)
    }

    /// One byte per voxel (`1` where the value is non-zero), x fastest.
    ///
    /// Every slice must be populated.
    pub fn to_mask(&self) -> Result<Vec<u8>> {
        let voxels = self.slice_voxels();
        let mut mask = Vec::with_capacity(voxels * self.size[2]);
        for z in 0..self.size[2] {
            let slice = self.read_slice(z)?;
            mask.extend((0..voxels).map(|i| (read_raw(self.format, slice, i) != 0) as u8));
        }
        Ok(mask)
    }

    fn recompute_value_range(&mut self) {
        self.min = self.format.max_level();
        self.max = self.format.min_level();
        let voxels = self.slice_voxels();
        for z in 0..self.size[2] {
            if !self.populated.contains(z) {
                continue;
            }
            if let Some((lo, hi)) = raw_value_range(self.format, &self.slices[z], voxels) {
                self.min = self.min.min(lo);
                self.max = self.max.max(hi);
            }
        }
    }

    /// Get a summary string of the volume
    pub fn summary(&self) -> String {
        format!(
            "{}x{}x{} {} volume, {}/{} slices populated, {}",
            self.size[0],
            self.size[1],
            self.size[2],
            self.format,
            self.populated.count(),
            self.size[2],
            format_bytes(self.byte_size())
        )
    }
}

/// Copy `source` into `dest` when both are shared handles.
///
/// Copying a volume into itself is rejected.
pub fn copy_shared(
    dest: &SharedVolume,
    source: &SharedVolume,
    region: Option<Box3>,
    dest_offset: Option<[i64; 3]>,
) -> Result<()> {
    if Arc::ptr_eq(dest, source) {
        return Err(VolumeError::Validation(
            "Cannot copy a volume into itself".to_string(),
        ));
    }
    let source = source.read();
    dest.write().copy_from(&source, region, dest_offset)
}

/// Decode voxel `index` of a slice buffer
pub(crate) fn read_raw(format: PixelFormat, buf: &[u8], index: usize) -> i32 {
    match format {
        PixelFormat::Binary => ((buf[index / 8] >> (7 - index % 8)) & 1) as i32,
        PixelFormat::Int8 => buf[index] as i8 as i32,
        PixelFormat::UInt8 => buf[index] as i32,
        PixelFormat::Int16 => i16::from_ne_bytes([buf[index * 2], buf[index * 2 + 1]]) as i32,
        PixelFormat::UInt16 => u16::from_ne_bytes([buf[index * 2], buf[index * 2 + 1]]) as i32,
    }
}

/// Encode voxel `index` of a slice buffer
pub(crate) fn write_raw(format: PixelFormat, buf: &mut [u8], index: usize, value: i32) {
    match format {
        PixelFormat::Binary => {
            let mask = 1u8 << (7 - index % 8);
            if value != 0 {
                buf[index / 8] |= mask;
            } else {
                buf[index / 8] &= !mask;
            }
        }
        PixelFormat::Int8 | PixelFormat::UInt8 => buf[index] = value as u8,
        PixelFormat::Int16 => {
            buf[index * 2..index * 2 + 2].copy_from_slice(&(value as i16).to_ne_bytes())
        }
        PixelFormat::UInt16 => {
            buf[index * 2..index * 2 + 2].copy_from_slice(&(value as u16).to_ne_bytes())
        }
    }
}

pub(crate) fn raw_value_range(
    format: PixelFormat,
    buf: &[u8],
    voxels: usize,
) -> Option<(i32, i32)> {
    (0..voxels).map(|i| read_raw(format, buf, i)).fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
