//! Little-endian fixed-width primitives.
//!
//! These do no bounds checking of their own: callers must ensure that
//! `offset + width <= buf.len()`. Checked access lives in [`crate::reader`].

#[inline]
pub fn read_u8(buf: &[u8], offset: usize) -> u8 {
    buf[offset]
}

#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[inline]
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub fn write_u8(buf: &mut [u8], offset: usize, value: u8) {
    buf[offset] = value;
}

#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut buf = [0u8; 16];
        write_u32(&mut buf, 1, 0x11223344);
        assert_eq!(&buf[1..5], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(read_u16(&buf, 1), 0x3344);
        assert_eq!(read_u32(&buf, 1), 0x11223344);
    }

    #[test]
    fn test_unaligned_u64() {
        let mut buf = [0u8; 16];
        write_u64(&mut buf, 3, 0x0102030405060708);
        assert_eq!(read_u64(&buf, 3), 0x0102030405060708);
        assert_eq!(read_u8(&buf, 3), 0x08);
        write_u8(&mut buf, 0, 0xAA);
        write_u16(&mut buf, 14, 0xBEEF);
        assert_eq!(buf[0], 0xAA);
        assert_eq!(read_u16(&buf, 14), 0xBEEF);
    }
}
