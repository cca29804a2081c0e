// Sparse clockwork hierarchy - helpers module

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

// --- Constants ---

pub const LIMIT_MIN: f32 = -999999.0;

/// Offset between per-item seeds derived from a single pool-level draw.
pub const RAND_SUBSEED_OFFSET: u64 = 12345;

pub const INIT_WEIGHT_LOW: f32 = -0.01;
pub const INIT_WEIGHT_HIGH: f32 = 0.0;

/// Upper bound on any tensor length read back from a stream.
pub const MAX_STREAM_ELEMENTS: usize = 1 << 30;

// --- Type aliases ---

/// One active cell index per column.
pub type IntBuffer = Vec<i32>;
pub type FloatBuffer = Vec<f32>;

// --- Vector types ---

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Int2 {
    pub x: i32,
    pub y: i32,
}

impl Int2 {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Number of entries in a grid of this size.
    pub fn area(self) -> usize {
        (self.x.max(0) * self.y.max(0)) as usize
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

// --- Math helpers ---

pub fn ceil_divide(x: i32, y: i32) -> i32 {
    (x + y - 1) / y
}

/// Squashed activation used as the "reconstruction" a delta rule compares
/// its target against. Saturates at 1 for non-negative inputs.
pub fn squash(x: f32) -> f32 {
    (1.0 + x.tanh()).min(1.0)
}

// --- Bounds checking ---

pub fn in_bounds0(pos: Int2, upper_bound: Int2) -> bool {
    pos.x >= 0 && pos.x < upper_bound.x && pos.y >= 0 && pos.y < upper_bound.y
}

pub fn in_bounds(pos: Int2, lower_bound: Int2, upper_bound: Int2) -> bool {
    pos.x >= lower_bound.x
        && pos.x <= upper_bound.x
        && pos.y >= lower_bound.y
        && pos.y <= upper_bound.y
}

// --- Projections ---

/// Map a column position onto another grid. Truncates toward zero.
pub fn project(pos: Int2, to_scalars: Float2) -> Int2 {
    Int2::new(
        ((pos.x as f32 + 0.5) * to_scalars.x) as i32,
        ((pos.y as f32 + 0.5) * to_scalars.y) as i32,
    )
}

// --- Addressing (x-major) ---

pub fn address2(pos: Int2, dims: Int2) -> usize {
    (pos.y + pos.x * dims.y) as usize
}

/// Inverse of [`address2`].
pub fn column_pos(index: usize, dims: Int2) -> Int2 {
    Int2::new(
        (index / dims.y as usize) as i32,
        (index % dims.y as usize) as i32,
    )
}

/// Position of cell `ci` inside its column (row-major within the column).
pub fn cell_offset(ci: i32, column_size: i32) -> Int2 {
    Int2::new(ci % column_size, ci / column_size)
}

/// Absolute cell position of cell `ci` in column `column`.
pub fn cell_pos(column: Int2, ci: i32, column_size: i32) -> Int2 {
    let offset = cell_offset(ci, column_size);
    Int2::new(
        column.x * column_size + offset.x,
        column.y * column_size + offset.y,
    )
}

/// First index of the maximum element. Ties keep the earliest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut max_index = 0;
    let mut max_value = LIMIT_MIN;

    for (i, &v) in values.iter().enumerate() {
        if v > max_value {
            max_value = v;
            max_index = i;
        }
    }

    max_index
}

// --- Serialization traits ---

pub trait StreamWriter {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_f32(&mut self, v: f32) -> io::Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_u8(&mut self, v: u8) -> io::Result<()> {
        self.write_bytes(&[v])
    }

    fn write_i32_slice(&mut self, slice: &[i32]) -> io::Result<()> {
        for &v in slice {
            self.write_i32(v)?;
        }
        Ok(())
    }

    fn write_f32_slice(&mut self, slice: &[f32]) -> io::Result<()> {
        for &v in slice {
            self.write_f32(v)?;
        }
        Ok(())
    }

    fn write_int2(&mut self, v: Int2) -> io::Result<()> {
        self.write_i32(v.x)?;
        self.write_i32(v.y)
    }
}

impl<W: Write + ?Sized> StreamWriter for W {
    fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)
    }
}

pub trait StreamReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()>;

    fn read_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_f32(&mut self) -> io::Result<f32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn read_i32_slice(&mut self, slice: &mut [i32]) -> io::Result<()> {
        for v in slice.iter_mut() {
            *v = self.read_i32()?;
        }
        Ok(())
    }

    fn read_f32_slice(&mut self, slice: &mut [f32]) -> io::Result<()> {
        for v in slice.iter_mut() {
            *v = self.read_f32()?;
        }
        Ok(())
    }

    fn read_int2(&mut self) -> io::Result<Int2> {
        let x = self.read_i32()?;
        let y = self.read_i32()?;
        Ok(Int2::new(x, y))
    }
}

impl<R: Read + ?Sized> StreamReader for R {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact(buf)
    }
}
