//! Accessors for the fixed width fields stored in the byte buffers. All of the
//! fields are little-endian

/// Invoke the `$macro` with all of the fixed width types that can be stored in a bucket
macro_rules! for_all_fixed_width {
    ($macro:ident) => {
        $macro! {
            i32,
            u32,
            i64,
            f32,
            f64
        }
    };
}

macro_rules! impl_fixed_width_accessors {
    ($($ty:ident),+) => {
        paste::paste! {
            $(
                #[doc = concat!("Read the `", stringify!($ty), "` stored at `position`")]
                ///
                /// # Panics
                ///
                /// Panics if `buffer` does not contain enough bytes after `position`
                #[inline]
                pub fn [<read_ $ty>](buffer: &[u8], position: usize) -> $ty {
                    let mut bytes = [0_u8; std::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(&buffer[position..position + std::mem::size_of::<$ty>()]);
                    $ty::from_le_bytes(bytes)
                }

                #[doc = concat!("Write the `", stringify!($ty), "` to `position`")]
                ///
                /// # Panics
                ///
                /// Panics if `buffer` does not contain enough bytes after `position`
                #[inline]
                pub fn [<write_ $ty>](buffer: &mut [u8], position: usize, value: $ty) {
                    buffer[position..position + std::mem::size_of::<$ty>()]
                        .copy_from_slice(&value.to_le_bytes());
                }
            )+
        }
    };
}

for_all_fixed_width!(impl_fixed_width_accessors);
