//! Instance-number (PPA) extraction from the caller's name hint.

/// How to pull an instance number out of a name hint like `"tun0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameParse {
    /// Historical behavior: if the hint contains a digit *anywhere*, the
    /// whole hint is run through an atoi-style leading-digits parse.
    ///
    /// This is a known quirk kept for compatibility: `"tun12"` contains
    /// digits but starts with a letter, so atoi yields 0 and instance 0 is
    /// requested instead of 12. (`"tun0"` happens to come out right.)
    #[default]
    Compat,
    /// Corrected behavior: parse the trailing run of decimal digits, if
    /// any. `"tun12"` requests instance 12.
    Suffix,
}

impl NameParse {
    /// Returns the instance number to bind, or `None` to let the kernel
    /// allocate a fresh one.
    pub fn ppa_from_hint(self, hint: Option<&str>) -> Option<u32> {
        let hint = hint?;
        match self {
            NameParse::Compat => hint
                .bytes()
                .any(|b| b.is_ascii_digit())
                .then(|| decimal_value(hint.bytes().take_while(u8::is_ascii_digit))),
            NameParse::Suffix => {
                let digits = &hint[hint.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
                (!digits.is_empty()).then(|| decimal_value(digits.bytes()))
            }
        }
    }
}

/// Saturating decimal accumulation; digits only, no sign or whitespace.
fn decimal_value(digits: impl Iterator<Item = u8>) -> u32 {
    digits.fold(0u32, |n, b| {
        n.saturating_mul(10).saturating_add(u32::from(b - b'0'))
    })
}
