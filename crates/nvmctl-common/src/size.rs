//! Byte-size units and alignment helpers.

pub const SZ_1K: u64 = 1 << 10;
pub const SZ_4K: u64 = 1 << 12;
pub const SZ_1M: u64 = 1 << 20;
pub const SZ_2M: u64 = 1 << 21;
pub const SZ_1G: u64 = 1 << 30;
pub const SZ_1T: u64 = 1 << 40;

pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

pub const fn is_power_of_two(value: u64) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Parses a size with an optional `K`/`M`/`G`/`T` suffix, returning the
/// value in bytes together with the unit it was expressed in. The unit is
/// kept so diagnostics can quote recommendations in the caller's terms.
pub fn parse_size(s: &str) -> Option<(u64, u64)> {
    let s = s.trim();
    let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => {
            let unit = match &s[idx..] {
                "k" | "K" | "KiB" => SZ_1K,
                "m" | "M" | "MiB" => SZ_1M,
                "g" | "G" | "GiB" => SZ_1G,
                "t" | "T" | "TiB" => SZ_1T,
                _ => return None,
            };
            (&s[..idx], unit)
        }
        None => (s, 1),
    };
    let value: u64 = digits.parse().ok()?;
    value.checked_mul(unit).map(|bytes| (bytes, unit))
}

/// Formats `bytes` in the largest unit that divides it exactly.
pub fn display_size(bytes: u64) -> String {
    for (unit, suffix) in [(SZ_1T, "T"), (SZ_1G, "G"), (SZ_1M, "M"), (SZ_1K, "K")] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    format!("{bytes}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(1, SZ_4K), SZ_4K);
        assert_eq!(align_up(SZ_4K, SZ_4K), SZ_4K);
        assert_eq!(align_down(SZ_4K + 1, SZ_4K), SZ_4K);
        assert!(is_power_of_two(SZ_2M));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3 * SZ_1K));
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("512"), Some((512, 1)));
        assert_eq!(parse_size("4K"), Some((SZ_4K, SZ_1K)));
        assert_eq!(parse_size("2M"), Some((SZ_2M, SZ_1M)));
        assert_eq!(parse_size("1G"), Some((SZ_1G, SZ_1G)));
        assert_eq!(parse_size("16x"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn size_display() {
        assert_eq!(display_size(SZ_1G), "1G");
        assert_eq!(display_size(3 * SZ_2M), "6M");
        assert_eq!(display_size(513), "513");
    }
}
