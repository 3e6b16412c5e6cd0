//! Element-wise reduction kernels used by the shard-reduce phase and by
//! the in-process fallback collectives.

use crate::error::{Result, ShmCommError};
use std::ops::{Add, Mul};

use crate::types::{DataType, ReduceOp};

/// A scalar the shard kernels can combine.
trait Element: Copy + PartialOrd + 'static {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

// Integers wrap on overflow; floats follow IEEE arithmetic.
macro_rules! element {
    ($($ty:ty => $add:ident, $mul:ident;)*) => {
        $(
            impl Element for $ty {
                #[inline]
                fn combine(self, other: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => self.$add(other),
                        ReduceOp::Prod => self.$mul(other),
                        ReduceOp::Min => if other < self { other } else { self },
                        ReduceOp::Max => if other > self { other } else { self },
                    }
                }
            }
        )*
    };
}

element! {
    i8 => wrapping_add, wrapping_mul;
    u8 => wrapping_add, wrapping_mul;
    i32 => wrapping_add, wrapping_mul;
    u32 => wrapping_add, wrapping_mul;
    i64 => wrapping_add, wrapping_mul;
    u64 => wrapping_add, wrapping_mul;
    f32 => add, mul;
    f64 => add, mul;
}

/// Element-wise reduce on byte slices interpreted as `dtype` elements.
///
/// `dst` and `src` must both contain at least `dtype.payload_len(count)` bytes.
pub fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let bytes = dtype.payload_len(count);
    if dst.len() < bytes || src.len() < bytes {
        return Err(ShmCommError::BufferSizeMismatch {
            expected: bytes,
            actual: dst.len().min(src.len()),
        });
    }
    // SAFETY: both slices were checked to hold `count` elements.
    unsafe {
        reduce_ptr(
            dst.as_mut_ptr() as u64,
            src.as_ptr() as u64,
            count,
            dtype,
            op,
        )
    }
}

/// Element-wise `dst[i] = op(dst[i], src[i])` through raw addresses.
///
/// Neither address needs to be aligned for `dtype`. `dst` and `src` may be
/// the same address but must not otherwise overlap.
///
/// # Safety
/// Both addresses must be valid for `dtype.payload_len(count)` bytes.
pub unsafe fn reduce_ptr(
    dst_ptr: u64,
    src_ptr: u64,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    let kernel: unsafe fn(u64, u64, usize, ReduceOp) = match dtype {
        DataType::I8 => combine_into::<i8>,
        DataType::U8 => combine_into::<u8>,
        DataType::I32 => combine_into::<i32>,
        DataType::U32 => combine_into::<u32>,
        DataType::I64 => combine_into::<i64>,
        DataType::U64 => combine_into::<u64>,
        DataType::F32 => combine_into::<f32>,
        DataType::F64 => combine_into::<f64>,
        DataType::F16 | DataType::BF16 => {
            return Err(ShmCommError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    };
    unsafe { kernel(dst_ptr, src_ptr, count, op) };
    Ok(())
}

/// Whether the kernels above can reduce `dtype`.
pub fn is_reducible(dtype: DataType) -> bool {
    !matches!(dtype, DataType::F16 | DataType::BF16)
}

/// # Safety
/// `dst_ptr` and `src_ptr` must be valid for `count` elements of type `T`.
unsafe fn combine_into<T: Element>(dst_ptr: u64, src_ptr: u64, count: usize, op: ReduceOp) {
    let dst = dst_ptr as *mut T;
    let src = src_ptr as *const T;
    for i in 0..count {
        unsafe {
            let d = dst.add(i).read_unaligned();
            let s = src.add(i).read_unaligned();
            dst.add(i).write_unaligned(d.combine(s, op));
        }
    }
}
