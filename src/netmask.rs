/// Derive the 16-byte IPv6 netmask for a prefix length.
///
/// Bytes fully inside the prefix are 0xff, bytes fully beyond it are 0x00,
/// and the boundary byte gets a left-justified mask covering the remaining
/// bits. Total over 0..=128; out-of-range prefixes are the caller's problem
/// (`configure` rejects them before ever calling this).
pub fn mask_for_prefix(prefix_len: u8) -> [u8; 16] {
    debug_assert!(prefix_len <= 128);

    let mut mask = [0u8; 16];
    for (i, byte) in mask.iter_mut().enumerate() {
        let bits = (prefix_len as usize).saturating_sub(i * 8).min(8);
        *byte = match bits {
            0 => 0x00,
            8 => 0xff,
            partial => 0xff << (8 - partial),
        };
    }
    mask
}
