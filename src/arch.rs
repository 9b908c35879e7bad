use crate::result::*;

/// A checked cast from u64 to usize
///
/// We could use the `cast` crate,
/// (https://docs.rs/cast/0.2.3/cast/)
/// but this is the only one we really need.
pub fn usize<I: Into<u64>>(i: I) -> ZipResult<usize> {
    let i: u64 = i.into();
    if cfg!(target_pointer_width = "64") {
        Ok(i as usize)
    } else if i > usize::MAX as u64 {
        Err(ZipError::InsufficientAddressSpace)
    } else {
        Ok(i as usize)
    }
}

/// Clamps a 64-bit value into a 32-bit header field,
/// substituting the Zip64 sentinel when it doesn't fit.
pub fn u32_or_sentinel(i: u64) -> u32 {
    if i >= u32::MAX as u64 {
        u32::MAX
    } else {
        i as u32
    }
}

/// Like [`u32_or_sentinel`], for the 16-bit count and disk fields.
pub fn u16_or_sentinel(i: u64) -> u16 {
    if i >= u16::MAX as u64 {
        u16::MAX
    } else {
        i as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinels() {
        assert_eq!(u32_or_sentinel(0xFFFF_FFFE), 0xFFFF_FFFE);
        assert_eq!(u32_or_sentinel(0xFFFF_FFFF), u32::MAX);
        assert_eq!(u32_or_sentinel(1 << 40), u32::MAX);
        assert_eq!(u16_or_sentinel(0xFFFE), 0xFFFE);
        assert_eq!(u16_or_sentinel(70_000), u16::MAX);
    }
}
