//! Resource name formatting.
//!
//! PCI device names like `"GH100 [H100 PCIe]"` become kubelet-compatible class
//! names like `"GH100_H100_PCIE"`.

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

static INVALID_CHARS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("Invalid character class regex"));

/// Convert a device name to a resource-name-safe class name.
///
/// Uppercases, maps `/` and `.` to `_`, collapses whitespace runs to a single
/// `_` and drops anything outside `[A-Za-z0-9_-]`.
pub fn format_device_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let name = name.to_uppercase().replace(['/', '.'], "_");
    let name = WHITESPACE_REGEX.replace_all(&name, "_");
    INVALID_CHARS_REGEX.replace_all(&name, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uppercase() {
        assert_eq!(format_device_name("geforce gtx 1080"), "GEFORCE_GTX_1080");
    }

    #[test]
    fn test_slash_and_dot() {
        assert_eq!(format_device_name("GK104.GL [GRID/K520]"), "GK104_GL_GRID_K520");
    }

    #[test]
    fn test_whitespace_runs() {
        assert_eq!(format_device_name("GeForce   GTX  1080"), "GEFORCE_GTX_1080");
        assert_eq!(format_device_name("A\t\nB"), "A_B");
    }

    #[test]
    fn test_strips_invalid_characters() {
        assert_eq!(format_device_name("Device [Name] (Rev A)"), "DEVICE_NAME_REV_A");
        assert_eq!(format_device_name("NVIDIA H100 PCIe [Hopper]"), "NVIDIA_H100_PCIE_HOPPER");
    }

    #[test]
    fn test_empty() {
        assert_eq!(format_device_name(""), "");
        assert_eq!(format_device_name("[]()"), "");
    }

    #[test]
    fn test_idempotent_and_charset() {
        let inputs = [
            "GeForce GTX 1080",
            "GK104.GL [GRID/K520]",
            "  leading and trailing  ",
            "ünïcödé nämé",
            "a-b_c.d/e f",
            "",
        ];
        let valid = Regex::new(r"^[A-Z0-9_-]*$").unwrap();
        for input in inputs {
            let once = format_device_name(input);
            assert_eq!(format_device_name(&once), once, "not idempotent for {:?}", input);
            assert!(valid.is_match(&once), "{:?} produced {:?}", input, once);
        }
    }
}
