//! N-dimensional grids over reference-counted storage.

use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::io;

/// Element types a [`Grid`] can hold.
///
/// The associated name is written into grid dumps and checked byte-for-byte
/// on load, so renaming a variant changes the file format.
pub trait Element: Copy + Default + PartialEq + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()>;
    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self>;
}

impl Element for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()> {
        out.write_f64::<LittleEndian>(*self)
    }

    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self> {
        input.read_f64::<LittleEndian>()
    }
}

impl Element for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()> {
        out.write_f32::<LittleEndian>(*self)
    }

    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self> {
        input.read_f32::<LittleEndian>()
    }
}

impl Element for u32 {
    const TYPE_NAME: &'static str = "u32";

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(*self)
    }

    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self> {
        input.read_u32::<LittleEndian>()
    }
}

impl Element for u64 {
    const TYPE_NAME: &'static str = "u64";

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()> {
        out.write_u64::<LittleEndian>(*self)
    }

    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self> {
        input.read_u64::<LittleEndian>()
    }
}

impl Element for Complex64 {
    const TYPE_NAME: &'static str = "c64";

    fn write_le(&self, out: &mut (impl Write + ?Sized)) -> std::io::Result<()> {
        out.write_f64::<LittleEndian>(self.re)?;
        out.write_f64::<LittleEndian>(self.im)
    }

    fn read_le(input: &mut (impl Read + ?Sized)) -> std::io::Result<Self> {
        let re = input.read_f64::<LittleEndian>()?;
        let im = input.read_f64::<LittleEndian>()?;
        Ok(Complex64::new(re, im))
    }
}

/// How caller indices map onto storage offsets.
///
/// The mode is metadata on the view: switching it never touches the buffer,
/// and two shallow copies of the same grid can use different modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Indices are used as-is; the caller guarantees `0 <= i < extent`.
    Identity,
    /// Indices live in `[-E/2, E/2)`; negative components wrap to `E + i`.
    /// Requires even extents.
    FftCentred,
    /// Indices are wrapped into range with a true modulus.
    Periodic,
}

/// A dense row-major grid of `T` with a selectable index transformation.
///
/// Storage is shared by reference counting: [`Grid::share`] yields a second
/// view onto the same cells, while `clone` performs a deep copy into a fresh
/// buffer.
#[derive(Debug)]
pub struct Grid<T: Element> {
    extents: Vec<usize>,
    mode: IndexMode,
    data: Arc<Vec<T>>,
}

/// Overflow-checked cell count of a grid shape.
pub fn cell_count(extents: &[usize]) -> Result<usize> {
    extents
        .iter()
        .try_fold(1usize, |acc, &e| acc.checked_mul(e))
        .ok_or_else(|| Error::shape(format!("cell count of extents {extents:?} overflows")))
}

fn check_mode(extents: &[usize], mode: IndexMode) -> Result<()> {
    if mode == IndexMode::FftCentred {
        for (axis, &extent) in extents.iter().enumerate() {
            if extent % 2 != 0 {
                return Err(Error::shape(format!(
                    "fft-centred indexing requires even extents, but axis {axis} has {extent}"
                )));
            }
        }
    }
    Ok(())
}

impl<T: Element> Grid<T> {
    /// Allocates a zero-initialised grid. Fails with `OutOfMemory` when the
    /// allocator cannot satisfy the request instead of aborting the process.
    pub fn try_new(extents: &[usize], mode: IndexMode) -> Result<Self> {
        if extents.is_empty() {
            return Err(Error::shape("grid requires at least one extent"));
        }
        check_mode(extents, mode)?;
        let count = cell_count(extents)?;

        let mut data = Vec::new();
        data.try_reserve_exact(count).map_err(|_| Error::OutOfMemory {
            bytes: count * std::mem::size_of::<T>(),
        })?;
        data.resize(count, T::default());

        Ok(Grid {
            extents: extents.to_vec(),
            mode,
            data: Arc::new(data),
        })
    }

    pub fn dimension(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: IndexMode) -> Result<()> {
        check_mode(&self.extents, mode)?;
        self.mode = mode;
        Ok(())
    }

    /// Shallow copy: shares the storage, keeps the current mode.
    pub fn share(&self) -> Self {
        Grid {
            extents: self.extents.clone(),
            mode: self.mode,
            data: Arc::clone(&self.data),
        }
    }

    /// Shallow copy with a different index mode.
    pub fn share_with_mode(&self, mode: IndexMode) -> Result<Self> {
        let mut shared = self.share();
        shared.set_mode(mode)?;
        Ok(shared)
    }

    /// Deep copy with a fallible allocation, for paths that recover from
    /// memory pressure.
    pub fn try_clone(&self) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())
            .map_err(|_| Error::OutOfMemory {
                bytes: self.data.len() * std::mem::size_of::<T>(),
            })?;
        data.extend_from_slice(&self.data);
        Ok(Grid {
            extents: self.extents.clone(),
            mode: self.mode,
            data: Arc::new(data),
        })
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable cell access. The buffer must not be shared; shallow copies are
    /// read-only views by contract.
    pub fn data_mut(&mut self) -> &mut [T] {
        Arc::get_mut(&mut self.data).expect("mutating a grid whose storage is shared")
    }

    /// Maps a multi-dimensional index to a storage offset using the grid mode.
    #[inline]
    pub fn offset(&self, index: &[i64]) -> usize {
        debug_assert_eq!(index.len(), self.extents.len());
        let mut offset = 0usize;
        match self.mode {
            IndexMode::Identity => {
                for (&i, &e) in index.iter().zip(&self.extents) {
                    debug_assert!(i >= 0 && (i as usize) < e);
                    offset = offset * e + i as usize;
                }
            }
            IndexMode::FftCentred => {
                for (&i, &e) in index.iter().zip(&self.extents) {
                    let wrapped = if i < 0 { e as i64 + i } else { i };
                    debug_assert!(wrapped >= 0 && (wrapped as usize) < e);
                    offset = offset * e + wrapped as usize;
                }
            }
            IndexMode::Periodic => {
                for (&i, &e) in index.iter().zip(&self.extents) {
                    offset = offset * e + i.rem_euclid(e as i64) as usize;
                }
            }
        }
        offset
    }

    #[inline]
    pub fn at(&self, index: &[i64]) -> T {
        self.data[self.offset(index)]
    }

    pub fn set(&mut self, index: &[i64], value: T) {
        let offset = self.offset(index);
        self.data_mut()[offset] = value;
    }

    /// Binary dump: tag byte `g`, dimension, extents, element-type name,
    /// cell count, raw little-endian cells.
    pub fn dump(&self, out: &mut (impl Write + ?Sized)) -> Result<()> {
        out.write_all(b"g")?;
        io::write_u64(out, self.dimension() as u64)?;
        for &extent in &self.extents {
            io::write_u64(out, extent as u64)?;
        }
        io::write_cstr(out, T::TYPE_NAME)?;
        io::write_u64(out, self.len() as u64)?;
        for value in self.data.iter() {
            value.write_le(out)?;
        }
        Ok(())
    }

    /// Reads a grid dump. The stored element-type name must match `T` exactly.
    pub fn load(input: &mut (impl Read + ?Sized)) -> Result<Self> {
        io::expect_magic(input, b"g")?;
        let dimension = io::read_u64(input)? as usize;
        if dimension == 0 {
            return Err(Error::format("grid dump declares zero dimensions"));
        }
        let mut extents = vec![0usize; dimension];
        for extent in &mut extents {
            *extent = io::read_u64(input)? as usize;
        }

        let type_name = io::read_cstr(input)?;
        if type_name != T::TYPE_NAME {
            return Err(Error::format(format!(
                "grid dump holds elements of type {type_name:?}, expected {:?}",
                T::TYPE_NAME
            )));
        }

        let count = io::read_u64(input)? as usize;
        if count != cell_count(&extents)? {
            return Err(Error::format(format!(
                "grid dump cell count {count} does not match extents {extents:?}"
            )));
        }

        let mut grid = Grid::try_new(&extents, IndexMode::Identity)?;
        for cell in grid.data_mut() {
            *cell = T::read_le(input)?;
        }
        Ok(grid)
    }
}

impl<T: Element> Clone for Grid<T> {
    /// Deep copy. Use [`Grid::share`] for a shallow, storage-sharing copy.
    fn clone(&self) -> Self {
        Grid {
            extents: self.extents.clone(),
            mode: self.mode,
            data: Arc::new(self.data.as_ref().clone()),
        }
    }
}
