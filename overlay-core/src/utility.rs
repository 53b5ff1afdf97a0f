//! Small helpers shared by the codec.

/// Adds methods to any `u8` iterator for reading fixed-width big-endian
/// integers off the front of it.
///
/// Each method consumes as many bytes as the integer needs and returns `None`
/// if the iterator ran out first.
///
/// ```
/// # use overlay_core::utility::BytesExt;
/// let arr = [0x00, 0x00, 0x01, 0x02, 0xFF];
/// let mut iter = arr.iter().cloned();
/// assert_eq!(iter.next_i32_be(), Some(0x0102));
/// assert_eq!(iter.next_u8(), Some(0xFF));
/// assert_eq!(iter.next_i64_be(), None);
/// ```
pub trait BytesExt: Iterator<Item = u8> {
    /// Advances the iterator and returns the next value.
    /// Functions identically to `Iterator<Item = u8>::next`.
    fn next_u8(&mut self) -> Option<u8> {
        self.next()
    }

    /// Advances the iterator by 4 bytes and combines them in big-endian order.
    fn next_u32_be(&mut self) -> Option<u32> {
        let arr = [self.next()?, self.next()?, self.next()?, self.next()?];
        Some(u32::from_be_bytes(arr))
    }

    /// Advances the iterator by 4 bytes, read as a two's complement i32.
    fn next_i32_be(&mut self) -> Option<i32> {
        self.next_u32_be().map(|n| n as i32)
    }

    /// Advances the iterator by 8 bytes, read as a two's complement i64.
    fn next_i64_be(&mut self) -> Option<i64> {
        let mut arr = [0u8; 8];
        for byte in arr.iter_mut() {
            *byte = self.next()?;
        }
        Some(i64::from_be_bytes(arr))
    }

    /// Takes exactly `len` bytes, or `None` if fewer remain.
    ///
    /// `len` often comes off the wire, so no more is reserved up front than
    /// the iterator says it holds.
    fn next_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(self.size_hint().0));
        for _ in 0..len {
            out.push(self.next()?);
        }
        Some(out)
    }
}

impl<T: Iterator<Item = u8>> BytesExt for T {}

#[cfg(test)]
mod tests {
    use super::BytesExt;

    #[test]
    fn signed_reads() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(-7i32).to_be_bytes());
        bytes.extend_from_slice(&(i64::MIN + 3).to_be_bytes());
        bytes.extend_from_slice(&[1, 2]);
        let mut iter = bytes.into_iter();
        assert_eq!(iter.next_i32_be(), Some(-7));
        assert_eq!(iter.next_i64_be(), Some(i64::MIN + 3));
        assert_eq!(iter.next_bytes(3), None);
    }

    #[test]
    fn huge_lengths_run_out_instead_of_allocating() {
        let mut iter = [1u8, 2, 3].into_iter();
        assert_eq!(iter.next_bytes(usize::MAX), None);

        let mut iter = [1u8, 2, 3].into_iter();
        assert_eq!(iter.next_bytes(2), Some(vec![1, 2]));
        assert_eq!(iter.next_u8(), Some(3));
    }
}
